// abi.rs — C-ABI contract between the host and a compiled procedure
//
// Every primary artifact exports one static procedure table under
// `PROCEDURE_SYMBOL`. The assembler emits a struct with the identical layout
// into each unit; the loader reads it back through `ProcedureTable`.
// Bump `ABI_VERSION` on any layout change: loaders reject mismatched tables
// and the owning block falls back to `NotCompiled`.

use std::ffi::c_void;

/// Current procedure ABI version.
pub const ABI_VERSION: u32 = 1;

/// Exported symbol name, NUL-terminated for `libloading`.
pub const PROCEDURE_SYMBOL: &[u8] = b"CODEBLOCK_PROCEDURE\0";

/// Name of the table struct inside generated units.
pub const TABLE_TYPE_NAME: &str = "CodeblockProcedureTable";

/// Status codes returned by `init` and `compute`.
pub mod status {
    pub const OK: i32 = 0;
    /// Inputs did not match the procedure's shape.
    pub const BAD_INPUT: i32 = 1;
    /// User code panicked; the panic was caught at the boundary.
    pub const PANICKED: i32 = 2;
}

pub type CreateFn = extern "C" fn() -> *mut c_void;
pub type DestroyFn = extern "C" fn(*mut c_void);
pub type InitFn = extern "C" fn(*mut c_void) -> i32;

/// `compute(handle, in_data, in_widths, in_ports, time, dt, out_data, out_widths, out_ports)`.
///
/// Port data is passed flattened: port `p` occupies `widths[p]` consecutive
/// values. In single mode every width is 1.
pub type ComputeFn = extern "C" fn(
    *mut c_void,
    *const f64,
    *const usize,
    usize,
    f64,
    f64,
    *mut f64,
    *const usize,
    usize,
) -> i32;

/// Host view of the exported procedure table.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ProcedureTable {
    pub abi_version: u32,
    pub shape: u32,
    pub create: CreateFn,
    pub destroy: DestroyFn,
    pub init: InitFn,
    pub compute: ComputeFn,
}

/// Source text of the table definition emitted into every unit. Must stay
/// layout-identical to [`ProcedureTable`].
pub(crate) fn table_definition() -> String {
    format!(
        "#[repr(C)]\n\
         pub struct {ty} {{\n\
         \x20   pub abi_version: u32,\n\
         \x20   pub shape: u32,\n\
         \x20   pub create: extern \"C\" fn() -> *mut ::std::ffi::c_void,\n\
         \x20   pub destroy: extern \"C\" fn(*mut ::std::ffi::c_void),\n\
         \x20   pub init: extern \"C\" fn(*mut ::std::ffi::c_void) -> i32,\n\
         \x20   pub compute: extern \"C\" fn(\n\
         \x20       *mut ::std::ffi::c_void,\n\
         \x20       *const f64,\n\
         \x20       *const usize,\n\
         \x20       usize,\n\
         \x20       f64,\n\
         \x20       f64,\n\
         \x20       *mut f64,\n\
         \x20       *const usize,\n\
         \x20       usize,\n\
         \x20   ) -> i32,\n\
         }}\n",
        ty = TABLE_TYPE_NAME
    )
}

/// Symbol name without the trailing NUL, as written in generated source.
pub(crate) fn symbol_name() -> &'static str {
    std::str::from_utf8(&PROCEDURE_SYMBOL[..PROCEDURE_SYMBOL.len() - 1]).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_is_nul_terminated() {
        assert_eq!(PROCEDURE_SYMBOL.last(), Some(&0));
        assert_eq!(symbol_name(), "CODEBLOCK_PROCEDURE");
    }

    #[test]
    fn table_definition_lists_every_field() {
        let text = table_definition();
        for field in ["abi_version", "shape", "create", "destroy", "init", "compute"] {
            assert!(
                text.contains(&format!("pub {field}:")),
                "missing field {field}"
            );
        }
        assert!(text.starts_with("#[repr(C)]\npub struct CodeblockProcedureTable {\n"));
    }
}
