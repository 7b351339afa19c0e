// fragments.rs — The four user-authored code fragments of a block
//
// A `SourceFragments` value is immutable once built. Edits produce a new
// value (either through the builder or `with_fragment`), which the owning
// block swaps in wholesale.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which of the four fragments an edit targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FragmentKind {
    /// Per-step body, wrapped inside `compute()`.
    Body,
    /// `use` lines and free items placed above the procedure.
    Imports,
    /// Statements wrapped inside `init()`.
    InitCode,
    /// `name: Type,` lines injected as private procedure state.
    FieldDeclarations,
}

impl FragmentKind {
    pub const ALL: [FragmentKind; 4] = [
        FragmentKind::Body,
        FragmentKind::Imports,
        FragmentKind::InitCode,
        FragmentKind::FieldDeclarations,
    ];

    /// Name of the scripting operation that replaces this fragment.
    pub fn operation_name(self) -> &'static str {
        match self {
            FragmentKind::Body => "setSourceCode",
            FragmentKind::Imports => "setImportCode",
            FragmentKind::InitCode => "setInitCode",
            FragmentKind::FieldDeclarations => "setVariablesCode",
        }
    }

    pub fn from_operation_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.operation_name() == name)
    }
}

impl fmt::Display for FragmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FragmentKind::Body => "body",
            FragmentKind::Imports => "imports",
            FragmentKind::InitCode => "init",
            FragmentKind::FieldDeclarations => "fields",
        };
        f.write_str(name)
    }
}

/// Immutable bundle of user code. Equality and hashing cover the ordered
/// tuple (body, imports, init, fields).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceFragments {
    body: String,
    imports: String,
    init_code: String,
    field_declarations: String,
}

impl SourceFragments {
    pub fn builder() -> FragmentsBuilder {
        FragmentsBuilder::default()
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn imports(&self) -> &str {
        &self.imports
    }

    pub fn init_code(&self) -> &str {
        &self.init_code
    }

    pub fn field_declarations(&self) -> &str {
        &self.field_declarations
    }

    pub fn get(&self, kind: FragmentKind) -> &str {
        match kind {
            FragmentKind::Body => &self.body,
            FragmentKind::Imports => &self.imports,
            FragmentKind::InitCode => &self.init_code,
            FragmentKind::FieldDeclarations => &self.field_declarations,
        }
    }

    /// Copy of `self` with one fragment replaced.
    pub fn with_fragment(&self, kind: FragmentKind, text: impl Into<String>) -> Self {
        let mut builder = FragmentsBuilder::from(self);
        builder = match kind {
            FragmentKind::Body => builder.body(text),
            FragmentKind::Imports => builder.imports(text),
            FragmentKind::InitCode => builder.init_code(text),
            FragmentKind::FieldDeclarations => builder.field_declarations(text),
        };
        builder.build()
    }

    /// Sum of fragment lengths, used to presize the assembled unit.
    pub fn total_len(&self) -> usize {
        self.body.len() + self.imports.len() + self.init_code.len() + self.field_declarations.len()
    }
}

/// Builder for [`SourceFragments`]. Unset fragments are empty.
#[derive(Debug, Clone, Default)]
pub struct FragmentsBuilder {
    body: String,
    imports: String,
    init_code: String,
    field_declarations: String,
}

impl FragmentsBuilder {
    pub fn body(mut self, text: impl Into<String>) -> Self {
        self.body = text.into();
        self
    }

    pub fn imports(mut self, text: impl Into<String>) -> Self {
        self.imports = text.into();
        self
    }

    pub fn init_code(mut self, text: impl Into<String>) -> Self {
        self.init_code = text.into();
        self
    }

    pub fn field_declarations(mut self, text: impl Into<String>) -> Self {
        self.field_declarations = text.into();
        self
    }

    pub fn build(self) -> SourceFragments {
        SourceFragments {
            body: self.body,
            imports: self.imports,
            init_code: self.init_code,
            field_declarations: self.field_declarations,
        }
    }
}

impl From<&SourceFragments> for FragmentsBuilder {
    fn from(f: &SourceFragments) -> Self {
        FragmentsBuilder {
            body: f.body.clone(),
            imports: f.imports.clone(),
            init_code: f.init_code.clone(),
            field_declarations: f.field_declarations.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn builder_defaults_to_empty() {
        let f = SourceFragments::builder().build();
        for kind in FragmentKind::ALL {
            assert_eq!(f.get(kind), "");
        }
    }

    #[test]
    fn with_fragment_replaces_only_one() {
        let f = SourceFragments::builder()
            .body("return outputs;")
            .imports("use std::f64::consts::PI;")
            .build();
        let g = f.with_fragment(FragmentKind::InitCode, "self.k = 2.0;");
        assert_eq!(g.body(), "return outputs;");
        assert_eq!(g.imports(), "use std::f64::consts::PI;");
        assert_eq!(g.init_code(), "self.k = 2.0;");
        assert_ne!(f, g);
    }

    #[test]
    fn equality_is_positional() {
        // Same strings in different slots must not compare equal.
        let a = SourceFragments::builder().body("x").imports("y").build();
        let b = SourceFragments::builder().body("y").imports("x").build();
        assert_ne!(a, b);
        let mut set = HashSet::new();
        set.insert(a.clone());
        assert!(set.contains(&a));
        assert!(!set.contains(&b));
    }

    #[test]
    fn operation_names_round_trip() {
        for kind in FragmentKind::ALL {
            assert_eq!(
                FragmentKind::from_operation_name(kind.operation_name()),
                Some(kind)
            );
        }
        assert_eq!(FragmentKind::from_operation_name("setNothing"), None);
    }
}
