//! Binary names, JVM signatures and runtime canonical names (RCNs).
//!
//! Binary names use dots for packages and `$` for nesting
//! (`com.example.Outer$Inner`); arrays are written `T[]`.

use rcn_jdwp::ObjectId;

/// A type as it appears in a field or method signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JavaType {
    Void,
    /// The Java keyword (`int`, `boolean`, ...).
    Primitive(&'static str),
    /// Binary name of a class, interface or array type.
    Reference(String),
}

fn primitive_keyword(tag: u8) -> Option<&'static str> {
    Some(match tag {
        b'Z' => "boolean",
        b'B' => "byte",
        b'C' => "char",
        b'S' => "short",
        b'I' => "int",
        b'J' => "long",
        b'F' => "float",
        b'D' => "double",
        _ => return None,
    })
}

/// Parses one field type from the front of `sig`, returning it and the rest.
fn parse_one(sig: &str) -> Option<(JavaType, &str)> {
    let first = *sig.as_bytes().first()?;
    match first {
        b'V' => Some((JavaType::Void, &sig[1..])),
        b'L' => {
            let end = sig.find(';')?;
            let name = sig[1..end].replace('/', ".");
            if name.is_empty() {
                return None;
            }
            Some((JavaType::Reference(name), &sig[end + 1..]))
        }
        b'[' => {
            let (component, rest) = parse_one(&sig[1..])?;
            let component = match component {
                JavaType::Void => return None,
                JavaType::Primitive(keyword) => keyword.to_owned(),
                JavaType::Reference(name) => name,
            };
            Some((JavaType::Reference(format!("{component}[]")), rest))
        }
        tag => primitive_keyword(tag).map(|keyword| (JavaType::Primitive(keyword), &sig[1..])),
    }
}

/// Parses a field (or local variable) signature such as `I` or `[Ljava/lang/String;`.
pub fn parse_field_signature(sig: &str) -> Option<JavaType> {
    match parse_one(sig)? {
        (JavaType::Void, _) => None,
        (ty, "") => Some(ty),
        _ => None,
    }
}

/// Parses a method signature into parameter types and return type.
pub fn parse_method_signature(sig: &str) -> Option<(Vec<JavaType>, JavaType)> {
    let mut rest = sig.strip_prefix('(')?;
    let mut params = Vec::new();
    while !rest.starts_with(')') {
        let (param, tail) = parse_one(rest)?;
        if param == JavaType::Void {
            return None;
        }
        params.push(param);
        rest = tail;
    }
    let (ret, tail) = parse_one(&rest[1..])?;
    tail.is_empty().then_some((params, ret))
}

/// `Lcom/example/Foo;` -> `com.example.Foo`, `[I` -> `int[]`.
pub fn signature_to_binary_name(sig: &str) -> Option<String> {
    match parse_field_signature(sig)? {
        JavaType::Reference(name) => Some(name),
        _ => None,
    }
}

pub fn array_component(name: &str) -> Option<&str> {
    name.strip_suffix("[]")
}

/// What a binary name says about where a type was declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameShape<'a> {
    TopLevel,
    /// `Outer$Inner`
    Member { outer: &'a str },
    /// `Outer$1`
    Anonymous { outer: &'a str },
    /// `Outer$1Local`
    Local { outer: &'a str },
    Array { component: &'a str },
}

pub fn classify(name: &str) -> NameShape<'_> {
    if let Some(component) = array_component(name) {
        return NameShape::Array { component };
    }
    let simple_start = name.rfind('.').map_or(0, |idx| idx + 1);
    let Some(dollar) = name[simple_start..].rfind('$').map(|idx| simple_start + idx) else {
        return NameShape::TopLevel;
    };
    let (outer, suffix) = (&name[..dollar], &name[dollar + 1..]);
    if outer.len() == simple_start || suffix.is_empty() {
        return NameShape::TopLevel;
    }

    let digits = suffix.bytes().take_while(u8::is_ascii_digit).count();
    if digits == suffix.len() {
        NameShape::Anonymous { outer }
    } else if digits > 0 {
        NameShape::Local { outer }
    } else {
        NameShape::Member { outer }
    }
}

/// The defining loader of a type, as far as RCNs are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderKind {
    Bootstrap,
    System,
    User(ObjectId),
}

impl LoaderKind {
    pub fn of(loader: Option<ObjectId>, system_loader: Option<ObjectId>) -> Self {
        match loader {
            None => LoaderKind::Bootstrap,
            Some(id) if Some(id) == system_loader => LoaderKind::System,
            Some(id) => LoaderKind::User(id),
        }
    }

    fn prefix(&self) -> String {
        match self {
            LoaderKind::Bootstrap => String::new(),
            LoaderKind::System => "SysLoader-".to_owned(),
            LoaderKind::User(id) => format!("Loader{id}-"),
        }
    }
}

/// RCN of a loaded class, interface or array type.
pub fn type_rcn(loader: LoaderKind, name: &str) -> String {
    format!("{}{name}", loader.prefix())
}

/// RCN of a type the relevant loader has not loaded.
pub fn unprepared_rcn(name: &str) -> String {
    format!("Unprepared-{name}")
}

pub fn field_rcn(owner_rcn: &str, field: &str) -> String {
    format!("{owner_rcn}.{field}")
}

pub fn method_rcn<'a>(
    owner_rcn: &str,
    return_rcn: &str,
    name: &str,
    params: impl IntoIterator<Item = &'a str>,
) -> String {
    let params = params.into_iter().collect::<Vec<_>>().join(",");
    format!("{owner_rcn}.-{return_rcn}-{name}({params})")
}

/// RCN of a local variable. Names declared more than once in a method are
/// disambiguated by the code index where their scope starts.
pub fn variable_rcn(method_rcn: &str, name: &str, scope_start: Option<u64>) -> String {
    match scope_start {
        Some(index) => format!("{method_rcn}.{name}-{index}"),
        None => format!("{method_rcn}.{name}"),
    }
}
