// shape.rs — Port cardinality and channel widths of a block
//
// Read by the assembler (output buffer sizing) and by the execution façade
// (input validation, output buffer layout).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The two interchangeable procedure shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcedureShape {
    /// One scalar per port and step; inputs/outputs are flat vectors.
    Single,
    /// One vector per port and step; widths configurable per output port.
    Matrix,
}

impl ProcedureShape {
    /// Tag carried in the exported procedure table.
    pub fn abi_tag(self) -> u32 {
        match self {
            ProcedureShape::Single => 0,
            ProcedureShape::Matrix => 1,
        }
    }

    pub fn from_abi_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(ProcedureShape::Single),
            1 => Some(ProcedureShape::Matrix),
            _ => None,
        }
    }

    pub fn other(self) -> Self {
        match self {
            ProcedureShape::Single => ProcedureShape::Matrix,
            ProcedureShape::Matrix => ProcedureShape::Single,
        }
    }
}

impl fmt::Display for ProcedureShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcedureShape::Single => f.write_str("single"),
            ProcedureShape::Matrix => f.write_str("matrix"),
        }
    }
}

/// How output widths are chosen in matrix mode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BusWidth {
    /// Every output port carries the same number of channels.
    Fixed(usize),
    /// Width per output port; ports without an entry carry one channel.
    PerPort(BTreeMap<usize, usize>),
}

impl Default for BusWidth {
    fn default() -> Self {
        BusWidth::PerPort(BTreeMap::new())
    }
}

/// Port configuration of a block.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignalShape {
    pub shape: ProcedureShape,
    pub input_ports: usize,
    pub output_ports: usize,
    pub bus: BusWidth,
}

pub const DEFAULT_INPUT_PORTS: usize = 3;
pub const DEFAULT_OUTPUT_PORTS: usize = 2;

impl Default for SignalShape {
    fn default() -> Self {
        SignalShape::single(DEFAULT_INPUT_PORTS, DEFAULT_OUTPUT_PORTS)
    }
}

impl SignalShape {
    pub fn single(input_ports: usize, output_ports: usize) -> Self {
        SignalShape {
            shape: ProcedureShape::Single,
            input_ports,
            output_ports,
            bus: BusWidth::default(),
        }
    }

    pub fn matrix(input_ports: usize, output_ports: usize, bus: BusWidth) -> Self {
        SignalShape {
            shape: ProcedureShape::Matrix,
            input_ports,
            output_ports,
            bus,
        }
    }

    /// Channel count of output port `port`. Always 1 in single mode.
    pub fn output_width(&self, port: usize) -> usize {
        if self.shape == ProcedureShape::Single {
            return 1;
        }
        match &self.bus {
            BusWidth::Fixed(w) => *w,
            BusWidth::PerPort(widths) => widths.get(&port).copied().unwrap_or(1),
        }
    }

    pub fn output_widths(&self) -> Vec<usize> {
        (0..self.output_ports).map(|p| self.output_width(p)).collect()
    }

    /// Set the width of a single output port. A fixed bus switches to
    /// per-port widths, with every other port keeping the fixed width.
    pub fn set_port_width(&mut self, port: usize, width: usize) {
        match &mut self.bus {
            BusWidth::PerPort(widths) => {
                widths.insert(port, width);
            }
            BusWidth::Fixed(fixed) => {
                let mut widths: BTreeMap<usize, usize> =
                    (0..self.output_ports).map(|p| (p, *fixed)).collect();
                widths.insert(port, width);
                self.bus = BusWidth::PerPort(widths);
            }
        }
    }

    pub fn with_shape(&self, shape: ProcedureShape) -> Self {
        SignalShape {
            shape,
            ..self.clone()
        }
    }
}
