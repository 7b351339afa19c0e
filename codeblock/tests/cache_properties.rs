// Property-based tests for the assembler and the compile cache.
//
// Three categories:
// 1. Assembler purity: identical inputs give byte-identical unit text
// 2. Cache idempotence: a just-compiled block never asks to recompile
// 3. Cache sensitivity: any single fragment edit or aux add/remove is seen
//
// No toolchain is involved; compile results are synthesized.
// Uses proptest with explicit configuration to prevent CI flakiness.

use codeblock::artifact::{ArtifactKind, ArtifactStore};
use codeblock::assemble::{assemble, assemble_source};
use codeblock::block::{Block, BlockId};
use codeblock::cache::Staleness;
use codeblock::compile::{CompileOutcome, SUCCESS_TRAILER};
use codeblock::fragments::{FragmentKind, SourceFragments};
use codeblock::registry::{AuxiliarySourceFile, FileRegistry};
use codeblock::shape::{BusWidth, ProcedureShape, SignalShape};
use codeblock::state::CompileStatus;
use proptest::prelude::*;

// ── Strategies ──────────────────────────────────────────────────────────────

fn arb_fragment() -> impl Strategy<Value = String> {
    // Printable text including newlines and characters that need no escaping
    // in Rust source but would trip naive templating.
    proptest::string::string_regex("[a-z0-9_ ;{}()\\[\\]=+*.\n\"#]{0,60}").unwrap()
}

fn arb_fragments() -> impl Strategy<Value = SourceFragments> {
    (arb_fragment(), arb_fragment(), arb_fragment(), arb_fragment()).prop_map(
        |(body, imports, init, fields)| {
            SourceFragments::builder()
                .body(body)
                .imports(imports)
                .init_code(init)
                .field_declarations(fields)
                .build()
        },
    )
}

fn arb_shape() -> impl Strategy<Value = SignalShape> {
    let single = (0usize..6, 0usize..6).prop_map(|(i, o)| SignalShape::single(i, o));
    let fixed = (0usize..6, 0usize..6, 1usize..5)
        .prop_map(|(i, o, w)| SignalShape::matrix(i, o, BusWidth::Fixed(w)));
    let per_port = (0usize..6, 1usize..6, proptest::collection::btree_map(0usize..6, 1usize..5, 0..4))
        .prop_map(|(i, o, widths)| SignalShape::matrix(i, o, BusWidth::PerPort(widths)));
    prop_oneof![single, fixed, per_port]
}

fn arb_kind() -> impl Strategy<Value = FragmentKind> {
    prop_oneof![
        Just(FragmentKind::Body),
        Just(FragmentKind::Imports),
        Just(FragmentKind::InitCode),
        Just(FragmentKind::FieldDeclarations),
    ]
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Pretend the toolchain accepted the block's current inputs.
fn mark_compiled(block: &mut Block) {
    let job = block.compile_job();
    let mut store = ArtifactStore::with_toolchain("test");
    store.put(
        job.request.primary_name.clone(),
        ArtifactKind::Primary,
        vec![0u8; 4],
        job.request.primary_source.clone(),
    );
    for aux in &job.request.auxiliaries {
        store.put(
            aux.crate_name(),
            ArtifactKind::Auxiliary,
            vec![1u8; 4],
            aux.contents.clone(),
        );
    }
    let applied = block.apply_compile_result(
        &job,
        CompileOutcome::Success {
            store,
            diagnostics: Vec::new(),
            message: format!("{SUCCESS_TRAILER}\n"),
        },
    );
    assert!(applied);
}

// ── Properties ──────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn assembler_is_pure(fragments in arb_fragments(), shape in arb_shape()) {
        let a = assemble_source(&fragments, &shape, "unit_p");
        let b = assemble_source(&fragments.clone(), &shape.clone(), "unit_p");
        prop_assert_eq!(a, b);
    }

    #[test]
    fn fragment_lines_map_back(fragments in arb_fragments(), shape in arb_shape()) {
        let unit = assemble(&fragments, &shape, "unit_p");
        let lines: Vec<&str> = unit.source.lines().collect();
        for (kind, range) in &unit.fragment_lines {
            let original: Vec<&str> = fragments.get(*kind).lines().collect();
            prop_assert_eq!(range.len(), original.len());
            for (offset, text) in original.iter().enumerate() {
                let unit_line = range.start + offset;
                prop_assert!(lines[unit_line - 1].ends_with(text));
                prop_assert_eq!(unit.locate(unit_line), Some((*kind, offset + 1)));
            }
        }
    }

    #[test]
    fn compiled_block_is_fresh(fragments in arb_fragments(), shape in arb_shape()) {
        let mut block = Block::new(BlockId::new("p"), shape).with_fragments(fragments.clone());
        prop_assert_eq!(block.staleness(), Staleness::NeverCompiled);
        mark_compiled(&mut block);
        prop_assert_eq!(block.compile_status(), CompileStatus::Success);
        prop_assert_eq!(block.staleness(), Staleness::Fresh);
        prop_assert!(block.request_recompile(fragments).is_none());
    }

    #[test]
    fn any_fragment_edit_is_stale(
        fragments in arb_fragments(),
        shape in arb_shape(),
        kind in arb_kind(),
        suffix in "[a-z]{1,8}",
    ) {
        let mut block = Block::new(BlockId::new("p"), shape).with_fragments(fragments.clone());
        mark_compiled(&mut block);
        let edited_text = format!("{}{}", fragments.get(kind), suffix);
        let edited = fragments.with_fragment(kind, edited_text);
        let job = block.request_recompile(edited);
        prop_assert!(job.is_some());
        prop_assert_eq!(block.staleness(), Staleness::SourceChanged);
    }

    #[test]
    fn aux_add_or_remove_is_stale(
        fragments in arb_fragments(),
        stem in "[a-z][a-z0-9_]{0,8}",
        contents in "[a-z ;]{0,20}",
    ) {
        let mut registry = FileRegistry::new();
        let hash = registry
            .insert(AuxiliarySourceFile::new(format!("{stem}.rs"), contents))
            .unwrap();
        let mut block = Block::new(BlockId::new("p"), SignalShape::single(1, 1))
            .with_fragments(fragments);
        mark_compiled(&mut block);

        block.attach_file(&mut registry, &hash).unwrap();
        prop_assert_eq!(block.staleness(), Staleness::AuxiliaryAdded(stem.clone()));
        mark_compiled(&mut block);
        prop_assert_eq!(block.staleness(), Staleness::Fresh);

        block.detach_file(&mut registry, &hash).unwrap();
        prop_assert_eq!(block.staleness(), Staleness::AuxiliaryRemoved(stem));
    }

    #[test]
    fn variant_switch_always_invalidates(fragments in arb_fragments(), shape in arb_shape()) {
        let mut block = Block::new(BlockId::new("p"), shape.clone()).with_fragments(fragments.clone());
        mark_compiled(&mut block);
        let other = block.to_variant(shape.shape.other());
        prop_assert_eq!(other.compile_status(), CompileStatus::NotCompiled);
        prop_assert_eq!(other.fragments(), &fragments);
        prop_assert_eq!(other.shape().shape, shape.shape.other());
        let back = other.to_variant(shape.shape);
        prop_assert_eq!(back.shape(), &shape);
    }
}

#[test]
fn both_shapes_are_reachable() {
    let single = SignalShape::single(1, 1);
    assert_eq!(single.shape, ProcedureShape::Single);
    assert_eq!(single.with_shape(ProcedureShape::Matrix).shape, ProcedureShape::Matrix);
}
