// assemble.rs — Source assembly for code blocks
//
// Renders the four user fragments plus the signal shape into one
// self-contained Rust unit implementing the fixed procedure contract
// (`init()` and `compute(inputs, time, dt) -> outputs`) and exporting the
// C-ABI procedure table.
//
// Preconditions: none; fragments are inserted verbatim without validation.
// Postconditions: identical inputs produce byte-identical text.
// Failure modes: none here; syntax errors surface at compile time.
// Side effects: none.

use std::fmt::Write as _;
use std::ops::Range;

use crate::abi;
use crate::fragments::{FragmentKind, SourceFragments};
use crate::shape::{BusWidth, ProcedureShape, SignalShape};

const MIN_BUFFER_SIZE: usize = 4096;
const FIELD_INDENT: &str = "    ";
const BODY_INDENT: &str = "        ";

pub const BEGIN_SEGMENT: &str = "// ****************** your code segment ******************";
pub const END_SEGMENT: &str = "// ****************** end of code segment ******************";

// ── Public types ────────────────────────────────────────────────────────────

/// A fully assembled compilation unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledUnit {
    pub artifact_name: String,
    pub source: String,
    /// 1-based unit line ranges holding each fragment's text.
    pub fragment_lines: Vec<(FragmentKind, Range<usize>)>,
}

impl AssembledUnit {
    /// Map a unit line back to (fragment, 1-based line inside the fragment).
    pub fn locate(&self, unit_line: usize) -> Option<(FragmentKind, usize)> {
        self.fragment_lines
            .iter()
            .find(|(_, range)| range.contains(&unit_line))
            .map(|(kind, range)| (*kind, unit_line - range.start + 1))
    }
}

// ── Public entry points ─────────────────────────────────────────────────────

/// Assemble the unit text only. This is what the cache compares.
pub fn assemble_source(
    fragments: &SourceFragments,
    shape: &SignalShape,
    artifact_name: &str,
) -> String {
    assemble(fragments, shape, artifact_name).source
}

pub fn assemble(
    fragments: &SourceFragments,
    shape: &SignalShape,
    artifact_name: &str,
) -> AssembledUnit {
    let mut ctx = AssembleCtx::new(fragments, shape, artifact_name);
    ctx.emit_all();
    ctx.build_result()
}

/// Capacity hint: a power of two at least as large as the fragment text.
fn estimate_capacity(fragments: &SourceFragments) -> usize {
    let mut size = MIN_BUFFER_SIZE;
    while size < fragments.total_len() + MIN_BUFFER_SIZE {
        size *= 2;
    }
    size
}

// ── Internal context ────────────────────────────────────────────────────────

struct AssembleCtx<'a> {
    fragments: &'a SourceFragments,
    shape: &'a SignalShape,
    artifact_name: &'a str,
    out: String,
    line: usize,
    fragment_lines: Vec<(FragmentKind, Range<usize>)>,
}

impl<'a> AssembleCtx<'a> {
    fn new(fragments: &'a SourceFragments, shape: &'a SignalShape, artifact_name: &'a str) -> Self {
        AssembleCtx {
            fragments,
            shape,
            artifact_name,
            out: String::with_capacity(estimate_capacity(fragments)),
            line: 1,
            fragment_lines: Vec::with_capacity(4),
        }
    }

    fn build_result(self) -> AssembledUnit {
        AssembledUnit {
            artifact_name: self.artifact_name.to_string(),
            source: self.out,
            fragment_lines: self.fragment_lines,
        }
    }

    fn push_line(&mut self, text: &str) {
        self.out.push_str(text);
        self.out.push('\n');
        self.line += 1 + text.matches('\n').count();
    }

    /// Copy a fragment line by line with the given indentation, recording
    /// which unit lines it occupies.
    fn push_fragment(&mut self, kind: FragmentKind, indent: &str) {
        let start = self.line;
        let text = self.fragments.get(kind);
        for line in text.lines() {
            self.out.push_str(indent);
            self.out.push_str(line);
            self.out.push('\n');
            self.line += 1;
        }
        self.fragment_lines.push((kind, start..self.line));
    }

    fn is_matrix(&self) -> bool {
        self.shape.shape == ProcedureShape::Matrix
    }

    fn signal_type(&self) -> &'static str {
        if self.is_matrix() {
            "Vec<f64>"
        } else {
            "f64"
        }
    }

    // ── Top-level emit ──────────────────────────────────────────────────

    fn emit_all(&mut self) {
        self.emit_header_and_imports();
        self.emit_state_struct();
        self.emit_impl();
        self.emit_host_interface();
    }

    // ── Phase 1: Header and user imports ────────────────────────────────

    fn emit_header_and_imports(&mut self) {
        let header = format!(
            "// Generated by codeblock for {}. Edits are overwritten on recompile.",
            self.artifact_name
        );
        self.push_line(&header);
        self.push_line(
            "#![allow(dead_code, unused_imports, unused_mut, unused_variables, unused_assignments, non_snake_case)]",
        );
        self.push_line("");
        self.push_fragment(FragmentKind::Imports, "");
        self.push_line("");
    }

    // ── Phase 2: Procedure state ────────────────────────────────────────

    fn emit_state_struct(&mut self) {
        self.push_line("#[derive(Default)]");
        self.push_line("pub struct Procedure {");
        self.push_line("    // fields:");
        self.push_fragment(FragmentKind::FieldDeclarations, FIELD_INDENT);
        let buffer = format!("    outputs: Vec<{}>,", self.signal_type());
        self.push_line(&buffer);
        self.push_line("}");
        self.push_line("");
    }

    /// Initial value of the output buffer, sized per shape.
    fn output_buffer_expr(&self) -> String {
        let ports = self.shape.output_ports;
        if !self.is_matrix() {
            return format!("vec![0.0; {}]", ports);
        }
        match &self.shape.bus {
            BusWidth::Fixed(width) => format!("vec![vec![0.0; {}]; {}]", width, ports),
            BusWidth::PerPort(_) => {
                let mut expr = String::from("vec![");
                for port in 0..ports {
                    if port > 0 {
                        expr.push_str(", ");
                    }
                    let _ = write!(expr, "vec![0.0; {}]", self.shape.output_width(port));
                }
                expr.push(']');
                expr
            }
        }
    }

    // ── Phase 3: init() and compute() ───────────────────────────────────

    fn emit_impl(&mut self) {
        self.push_line("impl Procedure {");
        self.push_line("    fn new() -> Self {");
        self.push_line("        let mut procedure = Procedure::default();");
        let alloc = format!("        procedure.outputs = {};", self.output_buffer_expr());
        self.push_line(&alloc);
        self.push_line("        procedure");
        self.push_line("    }");
        self.push_line("");
        self.push_line("    fn init(&mut self) {");
        self.push_fragment(FragmentKind::InitCode, BODY_INDENT);
        self.push_line("    }");
        self.push_line("");
        let ty = self.signal_type();
        let signature = format!(
            "    fn compute(&mut self, inputs: &[{ty}], time: f64, dt: f64) -> &[{ty}] {{"
        );
        self.push_line(&signature);
        self.push_line("        let outputs = &mut self.outputs[..];");
        self.push_line(&format!("        {}", BEGIN_SEGMENT));
        self.push_fragment(FragmentKind::Body, BODY_INDENT);
        self.push_line(&format!("        {}", END_SEGMENT));
        self.push_line("    }");
        self.push_line("}");
        self.push_line("");
    }

    // ── Phase 4: C-ABI glue ─────────────────────────────────────────────

    fn emit_host_interface(&mut self) {
        self.push_line("// ── host interface ──");
        self.push_line("");
        let table = abi::table_definition();
        self.out.push_str(&table);
        self.line += table.matches('\n').count();
        self.push_line("");
        self.emit_create_destroy_init();
        self.emit_compute_entry();
        self.emit_table_static();
    }

    fn emit_create_destroy_init(&mut self) {
        const GLUE: &str = "\
extern \"C\" fn codeblock_create() -> *mut ::std::ffi::c_void {
    match ::std::panic::catch_unwind(Procedure::new) {
        Ok(procedure) => Box::into_raw(Box::new(procedure)) as *mut ::std::ffi::c_void,
        Err(_) => ::std::ptr::null_mut(),
    }
}

extern \"C\" fn codeblock_destroy(handle: *mut ::std::ffi::c_void) {
    if !handle.is_null() {
        drop(unsafe { Box::from_raw(handle as *mut Procedure) });
    }
}

extern \"C\" fn codeblock_init(handle: *mut ::std::ffi::c_void) -> i32 {
    let procedure = unsafe { &mut *(handle as *mut Procedure) };
    match ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| procedure.init())) {
        Ok(()) => STATUS_OK,
        Err(_) => STATUS_PANICKED,
    }
}
";
        let consts = format!(
            "const STATUS_OK: i32 = {};\nconst STATUS_BAD_INPUT: i32 = {};\nconst STATUS_PANICKED: i32 = {};\n",
            abi::status::OK,
            abi::status::BAD_INPUT,
            abi::status::PANICKED
        );
        self.out.push_str(&consts);
        self.line += 3;
        self.push_line("");
        self.out.push_str(GLUE);
        self.line += GLUE.matches('\n').count();
        self.push_line("");
    }

    fn emit_compute_entry(&mut self) {
        const PROLOGUE: &str = "\
extern \"C\" fn codeblock_compute(
    handle: *mut ::std::ffi::c_void,
    in_data: *const f64,
    in_widths: *const usize,
    in_ports: usize,
    time: f64,
    dt: f64,
    out_data: *mut f64,
    out_widths: *const usize,
    out_ports: usize,
) -> i32 {
    let procedure = unsafe { &mut *(handle as *mut Procedure) };
    let in_widths = unsafe { ::std::slice::from_raw_parts(in_widths, in_ports) };
    let out_widths = unsafe { ::std::slice::from_raw_parts(out_widths, out_ports) };
    let in_total: usize = in_widths.iter().sum();
    let out_total: usize = out_widths.iter().sum();
    let in_flat = unsafe { ::std::slice::from_raw_parts(in_data, in_total) };
    let out_flat = unsafe { ::std::slice::from_raw_parts_mut(out_data, out_total) };
    let run = ::std::panic::AssertUnwindSafe(|| {
";
        const SINGLE: &str = "\
        if in_widths.iter().any(|w| *w != 1) {
            return STATUS_BAD_INPUT;
        }
        let produced = procedure.compute(in_flat, time, dt);
        for (dst, src) in out_flat.iter_mut().zip(produced.iter()) {
            *dst = *src;
        }
        STATUS_OK
";
        const MATRIX: &str = "\
        let mut inputs: Vec<Vec<f64>> = Vec::with_capacity(in_widths.len());
        let mut offset = 0usize;
        for width in in_widths {
            inputs.push(in_flat[offset..offset + *width].to_vec());
            offset += *width;
        }
        let produced = procedure.compute(&inputs, time, dt);
        let mut offset = 0usize;
        for (port, width) in out_widths.iter().enumerate() {
            if let Some(values) = produced.get(port) {
                for (dst, src) in out_flat[offset..offset + *width].iter_mut().zip(values.iter()) {
                    *dst = *src;
                }
            }
            offset += *width;
        }
        STATUS_OK
";
        const EPILOGUE: &str = "\
    });
    match ::std::panic::catch_unwind(run) {
        Ok(code) => code,
        Err(_) => STATUS_PANICKED,
    }
}
";
        let body = if self.is_matrix() { MATRIX } else { SINGLE };
        for chunk in [PROLOGUE, body, EPILOGUE] {
            self.out.push_str(chunk);
            self.line += chunk.matches('\n').count();
        }
        self.push_line("");
    }

    fn emit_table_static(&mut self) {
        self.push_line("#[no_mangle]");
        let decl = format!(
            "pub static {}: {} = {} {{",
            abi::symbol_name(),
            abi::TABLE_TYPE_NAME,
            abi::TABLE_TYPE_NAME
        );
        self.push_line(&decl);
        let version = format!("    abi_version: {},", abi::ABI_VERSION);
        self.push_line(&version);
        let shape = format!("    shape: {},", self.shape.shape.abi_tag());
        self.push_line(&shape);
        self.push_line("    create: codeblock_create,");
        self.push_line("    destroy: codeblock_destroy,");
        self.push_line("    init: codeblock_init,");
        self.push_line("    compute: codeblock_compute,");
        self.push_line("};");
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn adder() -> SourceFragments {
        SourceFragments::builder()
            .body("outputs[0] = inputs[0] + inputs[1];\nreturn outputs;")
            .build()
    }

    #[test]
    fn identical_inputs_identical_text() {
        let shape = SignalShape::single(2, 1);
        let a = assemble_source(&adder(), &shape, "unit_1");
        let b = assemble_source(&adder(), &shape, "unit_1");
        assert_eq!(a, b);
    }

    #[test]
    fn artifact_name_appears_in_text() {
        let shape = SignalShape::single(2, 1);
        let a = assemble_source(&adder(), &shape, "unit_1");
        let b = assemble_source(&adder(), &shape, "unit_2");
        assert_ne!(a, b);
        assert!(a.contains("unit_1"));
    }

    #[test]
    fn single_shape_buffer_and_signature() {
        let src = assemble_source(&adder(), &SignalShape::single(2, 3), "unit_1");
        assert!(src.contains("    outputs: Vec<f64>,\n"));
        assert!(src.contains("procedure.outputs = vec![0.0; 3];"));
        assert!(src.contains("fn compute(&mut self, inputs: &[f64], time: f64, dt: f64) -> &[f64] {"));
        assert!(src.contains("    shape: 0,\n"));
    }

    #[test]
    fn matrix_fixed_bus_buffer() {
        let shape = SignalShape::matrix(1, 2, BusWidth::Fixed(4));
        let src = assemble_source(&adder(), &shape, "unit_1");
        assert!(src.contains("    outputs: Vec<Vec<f64>>,\n"));
        assert!(src.contains("procedure.outputs = vec![vec![0.0; 4]; 2];"));
        assert!(src.contains("inputs: &[Vec<f64>]"));
        assert!(src.contains("    shape: 1,\n"));
    }

    #[test]
    fn matrix_per_port_buffer() {
        let mut widths = BTreeMap::new();
        widths.insert(1, 3);
        let shape = SignalShape::matrix(1, 3, BusWidth::PerPort(widths));
        let src = assemble_source(&adder(), &shape, "unit_1");
        assert!(src.contains("procedure.outputs = vec![vec![0.0; 1], vec![0.0; 3], vec![0.0; 1]];"));
    }

    #[test]
    fn fragments_are_indented_and_ordered() {
        let f = SourceFragments::builder()
            .imports("use std::f64::consts::PI;")
            .field_declarations("gain: f64,\ncount: u64,")
            .init_code("self.gain = PI;")
            .body("self.count += 1;\nreturn outputs;")
            .build();
        let src = assemble_source(&f, &SignalShape::single(1, 1), "unit_9");
        let imports = src.find("use std::f64::consts::PI;").unwrap();
        let fields = src.find("    gain: f64,\n    count: u64,\n").unwrap();
        let init = src.find("        self.gain = PI;\n").unwrap();
        let begin = src.find(BEGIN_SEGMENT).unwrap();
        let body = src.find("        self.count += 1;\n        return outputs;\n").unwrap();
        let end = src.find(END_SEGMENT).unwrap();
        assert!(imports < fields && fields < init && init < begin);
        assert!(begin < body && body < end);
    }

    #[test]
    fn locate_maps_unit_lines_to_fragments() {
        let f = SourceFragments::builder()
            .field_declarations("a: f64,")
            .body("let x = 1.0;\nreturn outputs;")
            .build();
        let unit = assemble(&f, &SignalShape::single(1, 1), "unit_1");
        let lines: Vec<&str> = unit.source.lines().collect();
        let body_line = lines
            .iter()
            .position(|l| l.trim() == "return outputs;")
            .unwrap()
            + 1;
        assert_eq!(unit.locate(body_line), Some((FragmentKind::Body, 2)));
        let field_line = lines.iter().position(|l| l.trim() == "a: f64,").unwrap() + 1;
        assert_eq!(
            unit.locate(field_line),
            Some((FragmentKind::FieldDeclarations, 1))
        );
        assert_eq!(unit.locate(1), None);
    }

    #[test]
    fn line_counter_matches_text() {
        let unit = assemble(&adder(), &SignalShape::matrix(2, 2, BusWidth::Fixed(2)), "u");
        let (_, body) = unit
            .fragment_lines
            .iter()
            .find(|(k, _)| *k == FragmentKind::Body)
            .unwrap();
        let lines: Vec<&str> = unit.source.lines().collect();
        assert_eq!(lines[body.start - 1].trim(), "outputs[0] = inputs[0] + inputs[1];");
        assert_eq!(lines[body.end - 2].trim(), "return outputs;");
    }

    #[test]
    fn unit_prologue_snapshot() {
        let f = SourceFragments::builder()
            .imports("use std::f64::consts::PI;")
            .field_declarations("gain: f64,")
            .init_code("self.gain = PI;")
            .body("outputs[0] = self.gain * inputs[0];\nreturn outputs;")
            .build();
        let src = assemble_source(&f, &SignalShape::single(1, 1), "unit_snap");
        let prologue: String = src
            .lines()
            .take_while(|l| !l.starts_with("// ── host interface"))
            .collect::<Vec<_>>()
            .join("\n")
            .trim_end()
            .to_string();
        insta::assert_snapshot!(prologue, @r###"
        // Generated by codeblock for unit_snap. Edits are overwritten on recompile.
        #![allow(dead_code, unused_imports, unused_mut, unused_variables, unused_assignments, non_snake_case)]

        use std::f64::consts::PI;

        #[derive(Default)]
        pub struct Procedure {
            // fields:
            gain: f64,
            outputs: Vec<f64>,
        }

        impl Procedure {
            fn new() -> Self {
                let mut procedure = Procedure::default();
                procedure.outputs = vec![0.0; 1];
                procedure
            }

            fn init(&mut self) {
                self.gain = PI;
            }

            fn compute(&mut self, inputs: &[f64], time: f64, dt: f64) -> &[f64] {
                let outputs = &mut self.outputs[..];
                // ****************** your code segment ******************
                outputs[0] = self.gain * inputs[0];
                return outputs;
                // ****************** end of code segment ******************
            }
        }
        "###);
    }
}
