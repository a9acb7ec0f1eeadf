//! Kernel signature inference.
//!
//! Kernel parameter lists are read straight from OpenCL C source text. The
//! parser is lexical: it locates the kernel declaration, splits the parameter
//! list on top-level commas and classifies every fragment with two independent
//! passes over its tokens, one for qualifiers and one for the base type. It
//! never checks that the program compiles; that is the backend's job.

use std::fmt;

use thiserror::Error;

use crate::buffer::ElementType;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("no kernel declaration{} found in source", .kernel.as_ref().map(|k| format!(" named `{k}`")).unwrap_or_default())]
    MissingDeclaration { kernel: Option<String> },
    #[error("unbalanced parentheses in parameter list")]
    UnbalancedParameters,
    #[error("parameter {index} (`{fragment}`) matches no supported argument type")]
    UnrecognizedArgumentType { index: usize, fragment: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgumentKind {
    IntScalar,
    LongScalar,
    FloatScalar,
    IntBuffer,
    FloatBuffer,
}

impl ArgumentKind {
    #[must_use]
    pub const fn is_buffer(self) -> bool {
        matches!(self, Self::IntBuffer | Self::FloatBuffer)
    }

    /// Element type of a buffer kind, `None` for scalars.
    #[must_use]
    pub const fn element(self) -> Option<ElementType> {
        match self {
            Self::IntBuffer => Some(ElementType::Int),
            Self::FloatBuffer => Some(ElementType::Float),
            _ => None,
        }
    }
}

/// Address space of a parameter. Unqualified parameters are private.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryScope {
    Global,
    Local,
    Private,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentDescriptor {
    pub kind: ArgumentKind,
    pub scope: MemoryScope,
    pub is_const: bool,
    /// Declared parameter name, kept for diagnostics.
    pub name: Option<String>,
}

impl fmt::Display for ArgumentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            MemoryScope::Global => f.write_str("global ")?,
            MemoryScope::Local => f.write_str("local ")?,
            MemoryScope::Private => {}
        }
        if self.is_const {
            f.write_str("const ")?;
        }
        let base = match self.kind {
            ArgumentKind::IntScalar | ArgumentKind::IntBuffer => "int",
            ArgumentKind::LongScalar => "long",
            ArgumentKind::FloatScalar | ArgumentKind::FloatBuffer => "float",
        };
        f.write_str(base)?;
        if self.kind.is_buffer() {
            f.write_str("*")?;
        }
        if let Some(name) = &self.name {
            write!(f, " {name}")?;
        }
        Ok(())
    }
}

/// Ordered parameter list of one kernel. Position is significant: binding
/// and dispatch are purely positional against this sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelSignature {
    args: Vec<ArgumentDescriptor>,
}

impl KernelSignature {
    #[must_use]
    pub fn new(args: Vec<ArgumentDescriptor>) -> Self {
        Self { args }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.args.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    #[must_use]
    pub fn get(&self, position: usize) -> Option<&ArgumentDescriptor> {
        self.args.get(position)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ArgumentDescriptor> {
        self.args.iter()
    }

    /// Number of parameters of the given kind.
    #[must_use]
    pub fn count(&self, kind: ArgumentKind) -> usize {
        self.args.iter().filter(|a| a.kind == kind).count()
    }
}

impl<'a> IntoIterator for &'a KernelSignature {
    type Item = &'a ArgumentDescriptor;
    type IntoIter = std::slice::Iter<'a, ArgumentDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.args.iter()
    }
}

/// Parses the parameter list of the first kernel declared in `source`.
///
/// # Errors
///
/// Returns [`SignatureError`] when no parameter list exists or a parameter
/// matches no supported type.
pub fn parse(source: &str) -> Result<KernelSignature, SignatureError> {
    parse_kernel(source, None)
}

/// Parses the parameter list of the kernel called `kernel`, or of the first
/// kernel when `kernel` is `None`.
///
/// Files without a `kernel`/`__kernel` keyword fall back to the first
/// parameter list in the text.
///
/// # Errors
///
/// See [`parse`].
pub fn parse_kernel(source: &str, kernel: Option<&str>) -> Result<KernelSignature, SignatureError> {
    let stripped = strip_comments(source);
    let tokens = tokenize(&stripped);
    let open = find_parameter_list(&tokens, kernel).ok_or_else(|| SignatureError::MissingDeclaration {
        kernel: kernel.map(str::to_owned),
    })?;
    let fragments = split_parameters(&tokens, open)?;

    // `()` and `(void)` declare no parameters.
    if fragments.len() == 1
        && (fragments[0].is_empty() || matches!(fragments[0].as_slice(), [Token::Ident("void")]))
    {
        return Ok(KernelSignature::default());
    }

    let args = fragments
        .iter()
        .enumerate()
        .map(|(index, fragment)| classify(index, fragment))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(KernelSignature::new(args))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'a> {
    Ident(&'a str),
    Punct(char),
}

impl fmt::Display for Token<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => f.write_str(s),
            Token::Punct(c) => write!(f, "{c}"),
        }
    }
}

fn strip_comments(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '/' {
            match chars.peek() {
                Some('/') => {
                    for c in chars.by_ref() {
                        if c == '\n' {
                            out.push('\n');
                            break;
                        }
                    }
                    continue;
                }
                Some('*') => {
                    chars.next();
                    let mut prev = '\0';
                    for c in chars.by_ref() {
                        if prev == '*' && c == '/' {
                            break;
                        }
                        prev = c;
                    }
                    out.push(' ');
                    continue;
                }
                _ => {}
            }
        }
        out.push(c);
    }
    out
}

fn tokenize(text: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut start: Option<usize> = None;
    for (i, c) in text.char_indices() {
        if c.is_alphanumeric() || c == '_' {
            start.get_or_insert(i);
            continue;
        }
        if let Some(s) = start.take() {
            tokens.push(Token::Ident(&text[s..i]));
        }
        if !c.is_whitespace() {
            tokens.push(Token::Punct(c));
        }
    }
    if let Some(s) = start {
        tokens.push(Token::Ident(&text[s..]));
    }
    tokens
}

/// Index of the `(` that opens the wanted kernel's parameter list.
fn find_parameter_list(tokens: &[Token<'_>], kernel: Option<&str>) -> Option<usize> {
    let mut saw_keyword = false;
    let mut i = 0;
    while i < tokens.len() {
        if matches!(tokens[i], Token::Ident("kernel" | "__kernel")) {
            saw_keyword = true;
            let open = tokens[i..].iter().position(|t| *t == Token::Punct('('))? + i;
            let name = match open.checked_sub(1).map(|p| tokens[p]) {
                Some(Token::Ident(name)) => Some(name),
                _ => None,
            };
            if kernel.is_none() || name == kernel {
                return Some(open);
            }
            i = open;
        }
        i += 1;
    }
    if saw_keyword {
        return None;
    }
    // No kernel keyword at all: take the first parameter list, optionally
    // checking the function name.
    let open = tokens.iter().position(|t| *t == Token::Punct('('))?;
    match (kernel, open.checked_sub(1).map(|p| tokens[p])) {
        (Some(wanted), Some(Token::Ident(name))) if name != wanted => None,
        _ => Some(open),
    }
}

fn split_parameters<'a>(tokens: &[Token<'a>], open: usize) -> Result<Vec<Vec<Token<'a>>>, SignatureError> {
    let mut fragments = vec![Vec::new()];
    let mut depth = 0usize;
    for &token in &tokens[open + 1..] {
        match token {
            Token::Punct('(') => depth += 1,
            Token::Punct(')') if depth == 0 => return Ok(fragments),
            Token::Punct(')') => depth -= 1,
            Token::Punct(',') if depth == 0 => {
                fragments.push(Vec::new());
                continue;
            }
            _ => {}
        }
        if let Some(current) = fragments.last_mut() {
            current.push(token);
        }
    }
    Err(SignatureError::UnbalancedParameters)
}

#[derive(Clone, Copy)]
enum BaseType {
    Int,
    Long,
    Float,
}

fn classify(index: usize, fragment: &[Token<'_>]) -> Result<ArgumentDescriptor, SignatureError> {
    let unrecognized = || SignatureError::UnrecognizedArgumentType {
        index,
        fragment: fragment.iter().map(ToString::to_string).collect::<Vec<_>>().join(" "),
    };
    let idents = || {
        fragment.iter().filter_map(|t| match t {
            Token::Ident(s) => Some(*s),
            Token::Punct(_) => None,
        })
    };

    // Qualifier pass.
    let mut scope = MemoryScope::Private;
    let mut is_const = false;
    for ident in idents() {
        match ident {
            "global" | "__global" => scope = MemoryScope::Global,
            "local" | "__local" => scope = MemoryScope::Local,
            "constant" | "__constant" => {
                scope = MemoryScope::Global;
                is_const = true;
            }
            "const" | "__const" => is_const = true,
            _ => {}
        }
    }

    // Base type pass.
    let has = |wanted: &[&str]| idents().any(|i| wanted.contains(&i));
    let base = if has(&["float"]) {
        BaseType::Float
    } else if has(&["long", "ulong"]) {
        BaseType::Long
    } else if has(&["int", "uint", "unsigned"]) {
        BaseType::Int
    } else {
        return Err(unrecognized());
    };

    // Pointer pass.
    let is_pointer = fragment.contains(&Token::Punct('*'));
    let kind = match (base, is_pointer) {
        (BaseType::Int, false) => ArgumentKind::IntScalar,
        (BaseType::Long, false) => ArgumentKind::LongScalar,
        (BaseType::Float, false) => ArgumentKind::FloatScalar,
        (BaseType::Int, true) => ArgumentKind::IntBuffer,
        (BaseType::Float, true) => ArgumentKind::FloatBuffer,
        (BaseType::Long, true) => return Err(unrecognized()),
    };

    let name = idents()
        .filter(|i| !is_keyword(i))
        .last()
        .map(str::to_owned);

    Ok(ArgumentDescriptor {
        kind,
        scope,
        is_const,
        name,
    })
}

fn is_keyword(ident: &str) -> bool {
    matches!(
        ident,
        "global"
            | "__global"
            | "local"
            | "__local"
            | "constant"
            | "__constant"
            | "const"
            | "__const"
            | "restrict"
            | "__restrict"
            | "volatile"
            | "float"
            | "int"
            | "uint"
            | "unsigned"
            | "long"
            | "ulong"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const VECTOR_ADD: &str = r"
        // element-wise sum
        __kernel void vector_add(__global const float* a,
                                 __global const float* b,
                                 __global float* c,
                                 int n) {
            int i = get_global_id(0);
            if (i < n) { c[i] = a[i] + b[i]; }
        }
    ";

    #[test]
    fn parses_declaration_order() {
        let sig = parse(VECTOR_ADD).unwrap();
        let kinds: Vec<_> = sig.iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ArgumentKind::FloatBuffer,
                ArgumentKind::FloatBuffer,
                ArgumentKind::FloatBuffer,
                ArgumentKind::IntScalar
            ]
        );
        assert!(sig.get(0).unwrap().is_const);
        assert!(!sig.get(2).unwrap().is_const);
        assert_eq!(sig.get(3).unwrap().scope, MemoryScope::Private);
        assert_eq!(sig.get(2).unwrap().name.as_deref(), Some("c"));
    }

    #[test]
    fn parsing_is_idempotent() {
        assert_eq!(parse(VECTOR_ADD).unwrap(), parse(VECTOR_ADD).unwrap());
    }

    #[test]
    fn qualifier_order_does_not_matter() {
        let a = parse("kernel void k(const global float* x)").unwrap();
        let b = parse("kernel void k(float const __global *x)").unwrap();
        let c = parse("kernel void k(global float const* x)").unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
        let arg = a.get(0).unwrap();
        assert_eq!(arg.kind, ArgumentKind::FloatBuffer);
        assert_eq!(arg.scope, MemoryScope::Global);
        assert!(arg.is_const);
    }

    #[test]
    fn keywords_are_matched_as_whole_tokens() {
        // `interval` contains "int", `floaty` contains "float".
        let sig = parse("kernel void k(global float* interval, int floaty, long points)").unwrap();
        let kinds: Vec<_> = sig.iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            vec![ArgumentKind::FloatBuffer, ArgumentKind::IntScalar, ArgumentKind::LongScalar]
        );
    }

    #[test]
    fn local_and_constant_scopes() {
        let sig = parse("__kernel void k(__local float* scratch, __constant int* table, uint n)").unwrap();
        assert_eq!(sig.get(0).unwrap().scope, MemoryScope::Local);
        assert_eq!(sig.get(0).unwrap().kind, ArgumentKind::FloatBuffer);
        assert_eq!(sig.get(1).unwrap().scope, MemoryScope::Global);
        assert!(sig.get(1).unwrap().is_const);
        assert_eq!(sig.get(1).unwrap().kind, ArgumentKind::IntBuffer);
        assert_eq!(sig.get(2).unwrap().kind, ArgumentKind::IntScalar);
    }

    #[test]
    fn unrecognized_fragment_names_its_index() {
        let err = parse("kernel void k(global int* a, double x, int n)").unwrap_err();
        assert_eq!(
            err,
            SignatureError::UnrecognizedArgumentType {
                index: 1,
                fragment: "double x".into()
            }
        );
    }

    #[test]
    fn long_pointer_is_unrecognized() {
        let err = parse("kernel void k(global long* a)").unwrap_err();
        assert!(matches!(err, SignatureError::UnrecognizedArgumentType { index: 0, .. }));
    }

    #[test]
    fn empty_and_void_lists() {
        assert!(parse("kernel void k()").unwrap().is_empty());
        assert!(parse("kernel void k(void)").unwrap().is_empty());
    }

    #[test]
    fn selects_named_kernel() {
        let source = "
            float helper(float x) { return x * 2.0f; }
            __kernel void first(global int* a) {}
            __kernel void second(global float* b, float s, long seed) {}
        ";
        assert_eq!(parse(source).unwrap().len(), 1);
        let sig = parse_kernel(source, Some("second")).unwrap();
        assert_eq!(sig.len(), 3);
        assert_eq!(sig.count(ArgumentKind::FloatScalar), 1);
        assert_eq!(sig.count(ArgumentKind::LongScalar), 1);
        assert!(matches!(
            parse_kernel(source, Some("third")),
            Err(SignatureError::MissingDeclaration { .. })
        ));
    }

    #[test]
    fn comments_inside_parameter_list_are_ignored() {
        let sig = parse("kernel void k(global int* a /* float */, // long\n int n)").unwrap();
        assert_eq!(sig.len(), 2);
        assert_eq!(sig.get(0).unwrap().kind, ArgumentKind::IntBuffer);
    }

    #[test]
    fn missing_or_unbalanced_lists() {
        assert!(matches!(parse("no parameters here"), Err(SignatureError::MissingDeclaration { .. })));
        assert_eq!(
            parse("kernel void k(global int* a, int n"),
            Err(SignatureError::UnbalancedParameters)
        );
    }

    #[test]
    fn descriptor_display_round_trips_through_parser() {
        let sig = parse(VECTOR_ADD).unwrap();
        let rendered = sig.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
        assert_eq!(rendered, "global const float* a, global const float* b, global float* c, int n");
        assert_eq!(parse(&format!("kernel void v({rendered})")).unwrap(), sig);
    }
}
