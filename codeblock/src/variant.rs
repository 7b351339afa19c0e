// variant.rs — Procedure variant selector and port signals
//
// Converting a block between the single and matrix shapes produces a new
// block with the same identity, fragments and auxiliary references but no
// compiled artifacts. User code is not translated between shapes.

use crate::block::Block;
use crate::shape::{ProcedureShape, SignalShape};
use crate::state::CompileState;

impl Block {
    /// A copy of this block using `shape`, always `NotCompiled`.
    pub fn to_variant(&self, shape: ProcedureShape) -> Block {
        tracing::debug!(block = %self.id, from = %self.shape.shape, to = %shape, "switching procedure variant");
        Block {
            id: self.id.clone(),
            fragments: self.fragments.clone(),
            shape: self.shape.with_shape(shape),
            aux_files: self.aux_files.clone(),
            state: CompileState::Uncompiled,
            run: None,
        }
    }

    /// Switch to the other shape.
    pub fn toggle_variant(&self) -> Block {
        self.to_variant(self.shape.shape.other())
    }
}

// ── Signals ─────────────────────────────────────────────────────────────────

/// Values crossing the solver boundary for one step.
#[derive(Debug, Clone, PartialEq)]
pub enum Signals {
    /// One scalar per port.
    Single(Vec<f64>),
    /// One vector per port.
    Matrix(Vec<Vec<f64>>),
}

impl Signals {
    pub fn shape(&self) -> ProcedureShape {
        match self {
            Signals::Single(_) => ProcedureShape::Single,
            Signals::Matrix(_) => ProcedureShape::Matrix,
        }
    }

    pub fn port_count(&self) -> usize {
        match self {
            Signals::Single(v) => v.len(),
            Signals::Matrix(ports) => ports.len(),
        }
    }

    pub fn widths(&self) -> Vec<usize> {
        match self {
            Signals::Single(v) => vec![1; v.len()],
            Signals::Matrix(ports) => ports.iter().map(Vec::len).collect(),
        }
    }

    /// Port values laid end to end.
    pub fn flatten(&self) -> Vec<f64> {
        match self {
            Signals::Single(v) => v.clone(),
            Signals::Matrix(ports) => ports.iter().flatten().copied().collect(),
        }
    }

    /// Split flat values back into ports of the given widths.
    pub fn from_flat(shape: ProcedureShape, flat: &[f64], widths: &[usize]) -> Signals {
        match shape {
            ProcedureShape::Single => Signals::Single(flat.to_vec()),
            ProcedureShape::Matrix => {
                let mut ports = Vec::with_capacity(widths.len());
                let mut offset = 0;
                for &w in widths {
                    ports.push(flat[offset..offset + w].to_vec());
                    offset += w;
                }
                Signals::Matrix(ports)
            }
        }
    }

    /// Whether these signals can feed the inputs of `shape`.
    pub fn fits_inputs(&self, shape: &SignalShape) -> bool {
        self.shape() == shape.shape && self.port_count() == shape.input_ports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockId;
    use crate::fragments::SourceFragments;
    use crate::shape::BusWidth;
    use crate::state::CompileStatus;

    #[test]
    fn variant_switch_keeps_fragments_and_resets_status() {
        let fragments = SourceFragments::builder()
            .body("return outputs;")
            .field_declarations("count: u64,")
            .build();
        let block = Block::new(BlockId::new("b7"), SignalShape::single(2, 1))
            .with_fragments(fragments.clone());
        let matrix = block.toggle_variant();
        assert_eq!(matrix.shape().shape, ProcedureShape::Matrix);
        assert_eq!(matrix.fragments(), &fragments);
        assert_eq!(matrix.compile_status(), CompileStatus::NotCompiled);
        assert_eq!(matrix.id(), block.id());

        let back = matrix.to_variant(ProcedureShape::Single);
        assert_eq!(back.shape(), block.shape());
        assert_ne!(back.generated_source_text(), matrix.generated_source_text());
    }

    #[test]
    fn matrix_signals_flatten_and_split() {
        let s = Signals::Matrix(vec![vec![1.0, 2.0], vec![], vec![3.0]]);
        assert_eq!(s.widths(), vec![2, 0, 1]);
        assert_eq!(s.flatten(), vec![1.0, 2.0, 3.0]);
        let back = Signals::from_flat(ProcedureShape::Matrix, &s.flatten(), &s.widths());
        assert_eq!(back, s);
    }

    #[test]
    fn input_fit_checks_shape_and_arity() {
        let shape = SignalShape::matrix(2, 1, BusWidth::Fixed(3));
        assert!(Signals::Matrix(vec![vec![1.0], vec![2.0, 3.0]]).fits_inputs(&shape));
        assert!(!Signals::Matrix(vec![vec![1.0]]).fits_inputs(&shape));
        assert!(!Signals::Single(vec![1.0, 2.0]).fits_inputs(&shape));
    }
}
