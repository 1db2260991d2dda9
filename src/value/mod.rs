use std::fmt;
use std::rc::Rc;

use serde::{Serialize, Serializer};

use crate::closure::Closure;
use crate::object::{NativeFunction, ObjectRef};

/// Documents at or below this version render `undefined` as an empty string.
pub const EMPTY_UNDEFINED_MAX_VERSION: u8 = 6;

#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Object(ObjectRef),
    NativeFunction(NativeFunction),
    ScriptFunction(Rc<Closure>),
}

impl Value {
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Null and undefined compare equal to each other and nothing else.
    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, Value::NativeFunction(_) | Value::ScriptFunction(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Value::String(_))
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// The object that carries this value's members: the object itself, or
    /// the property bag of a function.
    pub fn member_holder(&self) -> Option<ObjectRef> {
        match self {
            Value::Object(obj) => Some(obj.clone()),
            Value::NativeFunction(func) => Some(func.props().clone()),
            Value::ScriptFunction(closure) => Some(closure.props().clone()),
            _ => None,
        }
    }

    pub fn to_number(&self) -> f64 {
        match self {
            Value::Number(n) => *n,
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::String(s) => parse_number(s),
            Value::Object(obj) => obj.number_hook().unwrap_or(0.0),
            Value::Null | Value::Undefined => 0.0,
            Value::NativeFunction(_) | Value::ScriptFunction(_) => 0.0,
        }
    }

    pub fn to_bool(&self) -> bool {
        match self {
            Value::String(s) => match s.as_str() {
                "false" => false,
                "true" => true,
                _ => number_truthy(parse_number(s)),
            },
            Value::Number(n) => number_truthy(*n),
            Value::Bool(b) => *b,
            Value::Object(_) | Value::NativeFunction(_) | Value::ScriptFunction(_) => true,
            Value::Undefined | Value::Null => false,
        }
    }

    /// String coercion honouring the document version's rendering of
    /// `undefined`.
    pub fn to_string_versioned(&self, version: u8) -> String {
        match self {
            Value::Undefined if version <= EMPTY_UNDEFINED_MAX_VERSION => String::new(),
            _ => self.to_string(),
        }
    }

    /// ECMA-style ToInt32: truncate, then wrap modulo 2^32.
    pub fn to_int32(&self) -> i32 {
        number_to_int32(self.to_number())
    }

    pub fn to_uint32(&self) -> u32 {
        self.to_int32() as u32
    }

    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Object(obj) => obj.type_name(),
            Value::NativeFunction(_) | Value::ScriptFunction(_) => "function",
        }
    }

    /// Loose equality. Symmetric: numbers meet strings numerically,
    /// booleans compare as numbers, and objects meet primitives through
    /// their primitive form.
    pub fn loose_equals(&self, other: &Value) -> bool {
        if self.is_nullish() || other.is_nullish() {
            return self.is_nullish() && other.is_nullish();
        }
        let is_ref = |v: &Value| v.member_holder().is_some();
        match (self, other) {
            (a, b) if is_ref(a) && is_ref(b) => a.strict_equals(b),
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
                let parsed = parse_number(s);
                parsed.is_finite() && parsed == *n
            }
            (Value::Bool(_), _) => Value::Number(self.to_number()).loose_equals(other),
            (_, Value::Bool(_)) => self.loose_equals(&Value::Number(other.to_number())),
            (primitive, object) | (object, primitive) if is_ref(object) => {
                let converted = object.to_primitive();
                !is_ref(&converted) && primitive.loose_equals(&converted)
            }
            _ => false,
        }
    }

    /// Primitive form of an object: its number hook, else its text.
    /// Functions and primitives come back unchanged.
    pub fn to_primitive(&self) -> Value {
        match self {
            Value::Object(obj) => match obj.number_hook() {
                Some(n) => Value::Number(n),
                None => Value::String(self.to_string()),
            },
            other => other.clone(),
        }
    }

    /// Strict equality: identical variant kind, then payload comparison.
    /// Reference variants compare by identity.
    pub fn strict_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::NativeFunction(a), Value::NativeFunction(b)) => a.ptr_eq(b),
            (Value::ScriptFunction(a), Value::ScriptFunction(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// `<` in string-sensitive contexts: lexicographic when either side is a
    /// string, numeric otherwise. NaN orders as false.
    pub fn less_than(&self, other: &Value, version: u8) -> bool {
        if self.is_string() || other.is_string() {
            self.to_string_versioned(version) < other.to_string_versioned(version)
        } else {
            self.to_number() < other.to_number()
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        self.strict_equals(other)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::String(s) => write!(f, "{}", s),
            Value::Object(obj) => match obj.text_hook() {
                Some(text) => write!(f, "{}", text),
                None => write!(f, "[object Object]"),
            },
            Value::NativeFunction(_) | Value::ScriptFunction(_) => write!(f, "[type Function]"),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Undefined | Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) if n.is_finite() => serializer.serialize_f64(*n),
            Value::String(s) => serializer.serialize_str(s),
            other => serializer.serialize_str(&other.to_string()),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<ObjectRef> for Value {
    fn from(obj: ObjectRef) -> Self {
        Value::Object(obj)
    }
}

fn number_truthy(n: f64) -> bool {
    n != 0.0 && !n.is_nan()
}

pub fn number_to_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    n.trunc().rem_euclid(4_294_967_296.0) as u32 as i32
}

/// Shortest round-trippable decimal, with the legacy spellings for the
/// non-finite values.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n == f64::INFINITY {
        "+Infinity".to_string()
    } else if n == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else if n == 0.0 {
        "0".to_string()
    } else {
        format!("{}", n)
    }
}

/// strtod-like parse: leading whitespace is skipped, the whole remainder must
/// be a literal. Anything else is NaN.
pub fn parse_number(text: &str) -> f64 {
    let s = text.trim_start();
    if s.is_empty() {
        return f64::NAN;
    }
    if let Some(n) = parse_hex(s) {
        return n;
    }
    s.parse::<f64>().unwrap_or(f64::NAN)
}

fn parse_hex(s: &str) -> Option<f64> {
    let (negative, rest) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let digits = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X"))?;
    let n = u64::from_str_radix(digits, 16).ok()? as f64;
    Some(if negative { -n } else { n })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::PlainObject;

    #[test]
    fn number_to_string_spellings() {
        assert_eq!(Value::Number(f64::NAN).to_string(), "NaN");
        assert_eq!(Value::Number(1.0 / 0.0).to_string(), "+Infinity");
        assert_eq!(Value::Number(-1.0 / 0.0).to_string(), "-Infinity");
        assert_eq!(Value::Number(42.0).to_string(), "42");
        assert_eq!(Value::Number(0.1).to_string(), "0.1");
        assert_eq!(Value::Number(-0.0).to_string(), "0");
        assert_eq!(Value::Number(-2.5).to_string(), "-2.5");
    }

    #[test]
    fn string_to_number() {
        assert!(Value::from("NaN").to_number().is_nan());
        assert_eq!(Value::from("Infinity").to_number(), f64::INFINITY);
        assert_eq!(Value::from("-Infinity").to_number(), f64::NEG_INFINITY);
        assert_eq!(Value::from("+Infinity").to_number(), f64::INFINITY);
        assert_eq!(Value::from("  12.5").to_number(), 12.5);
        assert_eq!(Value::from("0x1A").to_number(), 26.0);
        assert!(Value::from("12abc").to_number().is_nan());
        assert!(Value::from("").to_number().is_nan());
        assert_eq!(Value::Null.to_number(), 0.0);
        assert_eq!(Value::Bool(true).to_number(), 1.0);
    }

    #[test]
    fn undefined_depends_on_version() {
        assert_eq!(Value::Undefined.to_string_versioned(6), "");
        assert_eq!(Value::Undefined.to_string_versioned(7), "undefined");
        assert_eq!(Value::Null.to_string_versioned(5), "null");
    }

    #[test]
    fn string_truthiness() {
        assert!(!Value::from("false").to_bool());
        assert!(Value::from("true").to_bool());
        assert!(Value::from("3").to_bool());
        assert!(!Value::from("0").to_bool());
        assert!(!Value::from("").to_bool());
        assert!(!Value::from("hello").to_bool());
        assert!(!Value::Number(f64::NAN).to_bool());
    }

    #[test]
    fn truthiness_survives_string_round_trip() {
        let values = [
            Value::Undefined,
            Value::Null,
            Value::Bool(true),
            Value::Bool(false),
            Value::Number(0.0),
            Value::Number(-3.5),
            Value::Number(f64::NAN),
            Value::Number(f64::INFINITY),
            Value::from("false"),
            Value::from("7"),
        ];
        for v in values {
            for version in [5, 7] {
                let through_string = Value::String(v.to_string_versioned(version));
                assert_eq!(through_string.to_bool(), v.to_bool(), "value {:?}", v);
            }
        }
    }

    #[test]
    fn loose_equality() {
        assert!(Value::Null.loose_equals(&Value::Undefined));
        assert!(!Value::Null.loose_equals(&Value::Number(0.0)));
        assert!(Value::from("1").loose_equals(&Value::Number(1.0)));
        assert!(Value::Number(1.0).loose_equals(&Value::from("1")));
        assert!(Value::Bool(true).loose_equals(&Value::Number(1.0)));
        assert!(!Value::Number(f64::NAN).loose_equals(&Value::Number(f64::NAN)));
    }

    #[test]
    fn loose_equality_is_symmetric() {
        let pairs = [
            (Value::from("1.0"), Value::Number(1.0), true),
            (Value::Bool(true), Value::Number(2.0), false),
            (Value::Bool(true), Value::Number(1.0), true),
            (Value::Bool(false), Value::from("0"), true),
            (Value::Bool(true), Value::from("true"), false),
            (Value::from("Infinity"), Value::Number(f64::INFINITY), false),
            (Value::from("abc"), Value::Number(0.0), false),
            (Value::Null, Value::Bool(false), false),
        ];
        for (a, b, expected) in pairs {
            assert_eq!(a.loose_equals(&b), expected, "{:?} == {:?}", a, b);
            assert_eq!(b.loose_equals(&a), expected, "{:?} == {:?}", b, a);
        }
    }

    #[test]
    fn objects_compare_through_primitives() {
        let array = ObjectRef::new(PlainObject::array(None, vec![Value::Number(1.0), Value::Number(2.0)]));
        let value = Value::Object(array.clone());
        assert!(value.loose_equals(&Value::from("1,2")));
        assert!(Value::from("1,2").loose_equals(&value));
        assert!(!value.loose_equals(&Value::Number(1.0)));
        assert!(value.loose_equals(&Value::Object(array)));

        let single = Value::Object(ObjectRef::new(PlainObject::array(None, vec![Value::Number(7.0)])));
        assert!(single.loose_equals(&Value::Number(7.0)));
        assert!(Value::Number(7.0).loose_equals(&single));
        assert!(!single.loose_equals(&Value::Object(ObjectRef::new(PlainObject::array(None, vec![Value::Number(7.0)])))));
    }

    #[test]
    fn strict_equality_checks_kind() {
        assert!(!Value::from("1").strict_equals(&Value::Number(1.0)));
        assert!(Value::Number(1.0).strict_equals(&Value::Number(1.0)));
        assert!(!Value::Null.strict_equals(&Value::Undefined));
    }

    #[test]
    fn ordering_is_string_sensitive() {
        assert!(Value::from("10").less_than(&Value::from("9"), 7));
        assert!(!Value::Number(10.0).less_than(&Value::Number(9.0), 7));
        assert!(!Value::Number(f64::NAN).less_than(&Value::Number(1.0), 7));
    }

    #[test]
    fn int32_wraps() {
        assert_eq!(Value::Number(4_294_967_297.0).to_int32(), 1);
        assert_eq!(Value::Number(-1.0).to_uint32(), u32::MAX);
        assert_eq!(Value::Number(f64::NAN).to_int32(), 0);
        assert_eq!(Value::Number(-7.9).to_int32(), -7);
    }

    #[test]
    fn serializes_to_json() {
        let json = serde_json::to_string(&vec![
            Value::Number(1.5),
            Value::from("a"),
            Value::Undefined,
            Value::Number(f64::NAN),
        ])
        .unwrap();
        assert_eq!(json, r#"[1.5,"a",null,"NaN"]"#);
    }
}
