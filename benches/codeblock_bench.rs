use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use codeblock::*;

// The cache check runs on every simulation start, so assembly and the
// staleness decision must stay cheap next to a compiler invocation.

const ADDER_BODY: &str = "outputs[0] = inputs[0] + inputs[1];\nreturn outputs;";

const FILTER_BODY: &str = r#"
let alpha = dt / (self.tau + dt);
for (i, x) in inputs.iter().enumerate().take(outputs.len()) {
    self.state[i] += alpha * (x - self.state[i]);
    outputs[i] = self.state[i];
}
return outputs;
"#;

fn scenarios() -> [(&'static str, fragments::SourceFragments, shape::SignalShape); 3] {
    [
        (
            "adder",
            fragments::SourceFragments::builder().body(ADDER_BODY).build(),
            shape::SignalShape::single(2, 1),
        ),
        (
            "filter",
            fragments::SourceFragments::builder()
                .field_declarations("tau: f64,\nstate: Vec<f64>,")
                .init_code("self.tau = 1e-3;\nself.state = vec![0.0; 8];")
                .body(FILTER_BODY)
                .build(),
            shape::SignalShape::single(8, 8),
        ),
        (
            "matrix",
            fragments::SourceFragments::builder()
                .body("outputs[0][0] = inputs[0].iter().sum();\nreturn outputs;")
                .build(),
            shape::SignalShape::matrix(4, 16, shape::BusWidth::Fixed(32)),
        ),
    ]
}

/// Body with `n` statement lines, for scaling.
fn generate_body(n: usize) -> String {
    let mut body = String::new();
    for i in 0..n {
        body.push_str(&format!("outputs[0] += inputs[0] * {}.0;\n", i));
    }
    body.push_str("return outputs;\n");
    body
}

/// A block whose cache reflects its current inputs.
fn compiled_block(f: fragments::SourceFragments, s: shape::SignalShape) -> block::Block {
    let mut b = block::Block::new(block::BlockId::new("bench"), s).with_fragments(f);
    let job = b.compile_job();
    let mut store = artifact::ArtifactStore::new();
    store.put(
        job.request.primary_name.clone(),
        artifact::ArtifactKind::Primary,
        vec![0u8; 16],
        job.request.primary_source.clone(),
    );
    b.apply_compile_result(
        &job,
        compile::CompileOutcome::Success {
            store,
            diagnostics: Vec::new(),
            message: String::new(),
        },
    );
    b
}

fn bench_assemble(c: &mut Criterion) {
    let mut group = c.benchmark_group("assemble");
    for (name, f, s) in scenarios() {
        group.bench_with_input(BenchmarkId::from_parameter(name), &(f, s), |b, (f, s)| {
            b.iter(|| assemble::assemble_source(black_box(f), black_box(s), "unit_bench"))
        });
    }
    group.finish();
}

fn bench_cache_check(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_check");
    for (name, f, s) in scenarios() {
        let block = compiled_block(f, s);
        group.bench_function(BenchmarkId::from_parameter(name), |b| {
            b.iter(|| black_box(&block).staleness())
        });
    }
    group.finish();
}

fn bench_assemble_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("assemble_scaling");
    for n in [10usize, 100, 1000] {
        let f = fragments::SourceFragments::builder()
            .body(generate_body(n))
            .build();
        let s = shape::SignalShape::single(1, 1);
        group.bench_with_input(BenchmarkId::from_parameter(n), &f, |b, f| {
            b.iter(|| assemble::assemble(black_box(f), &s, "unit_bench"))
        });
    }
    group.finish();
}

fn bench_blob_codec(c: &mut Criterion) {
    let mut store = artifact::ArtifactStore::with_toolchain("bench");
    store.put("unit_bench", artifact::ArtifactKind::Primary, vec![0xAB; 256 * 1024], ADDER_BODY);
    let blob = store.to_blob().expect("encode");
    c.bench_function("blob_encode_256k", |b| b.iter(|| black_box(&store).to_blob()));
    c.bench_function("blob_decode_256k", |b| {
        b.iter(|| artifact::ArtifactStore::from_blob(black_box(&blob), "unit_bench", Some("bench")))
    });
}

criterion_group!(
    benches,
    bench_assemble,
    bench_cache_check,
    bench_assemble_scaling,
    bench_blob_codec,
);
criterion_main!(benches);
