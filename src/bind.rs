//! Declarative request binding.
//!
//! A bindable type lists its fields once; binding then looks every field up
//! across the request's inputs and hands the assembled object to serde:
//!
//! ```rust,ignore
//! #[derive(Default, Deserialize)]
//! #[serde(default)]
//! struct Login {
//!     username: String,
//!     password: String,
//!     remember: bool,
//! }
//!
//! impl Bind for Login {
//!     fn fields() -> Vec<Field> {
//!         vec![
//!             Field::new("username").from("form,query").process("trim,tolower"),
//!             Field::new("password").from("form"),
//!             Field::new("remember").from("form").kind(Kind::Bool),
//!         ]
//!     }
//! }
//!
//! let login: Login = c.bind().await?;
//! ```
//!
//! Order of precedence: a JSON body (when the content type is JSON and the
//! body is not empty) is decoded first; then each field walks its sources in
//! the declared order and the first non-empty value overwrites whatever the
//! body supplied.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value as Json};

use crate::context::Context;
use crate::error::{Error, HttpError, Result};
use crate::handler::HandlerFuture;
use crate::request::Value;

/// A type that can be populated from a request.
pub trait Bind: DeserializeOwned {
    /// Field descriptors, in the order sources should be consulted.
    fn fields() -> Vec<Field>;
}

/// Where a field's value may come from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Source {
    /// The context store (`with_value`), then the request's values.
    Value,
    Header,
    /// Path parameter.
    Param,
    Query,
    /// Only consulted for URL-encoded and multipart bodies.
    Form,
    /// A multipart upload.
    File,
    Cookie,
}

impl Source {
    fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "value"  => Some(Self::Value),
            "header" => Some(Self::Header),
            "param"  => Some(Self::Param),
            "query"  => Some(Self::Query),
            "form"   => Some(Self::Form),
            "file"   => Some(Self::File),
            "cookie" => Some(Self::Cookie),
            _        => None,
        }
    }
}

/// Target type of a field; selects the conversion applied to string inputs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Kind {
    Str,
    Int,
    Uint,
    Float,
    Bool,
    /// Comma-separated list, or a JSON array.
    List(Box<Kind>),
    /// Arbitrary JSON text.
    Json,
    File,
}

/// A post-processing step for string values.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Process {
    Trim,
    ToLower,
    ToUpper,
    /// Keeps at most this many characters.
    Cut(usize),
}

impl Process {
    fn parse_list(s: &str) -> Vec<Self> {
        s.split(',')
            .map(str::trim)
            .filter_map(|op| match op {
                "trim"    => Some(Self::Trim),
                "tolower" => Some(Self::ToLower),
                "toupper" => Some(Self::ToUpper),
                _ => op
                    .strip_prefix("cut(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .and_then(|n| n.trim().parse().ok())
                    .map(Self::Cut),
            })
            .collect()
    }

    fn apply(self, s: String) -> String {
        match self {
            Self::Trim    => s.trim().to_owned(),
            Self::ToLower => s.to_lowercase(),
            Self::ToUpper => s.to_uppercase(),
            Self::Cut(n)  => s.chars().take(n).collect(),
        }
    }
}

/// Describes one bindable field.
#[derive(Clone, Debug)]
pub struct Field {
    name: String,
    sources: Vec<Source>,
    kind: Kind,
    process: Vec<Process>,
    nested: Option<Vec<Field>>,
}

impl Field {
    /// A string field named `name` on the wire, with no sources yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), sources: Vec::new(), kind: Kind::Str, process: Vec::new(), nested: None }
    }

    /// A sub-object bound recursively; it is only created when one of its
    /// fields finds a value.
    pub fn nested(name: impl Into<String>, fields: Vec<Field>) -> Self {
        Self { nested: Some(fields), ..Self::new(name) }
    }

    /// Comma-separated sources, e.g. `"header,query"`.
    ///
    /// # Panics
    ///
    /// Panics on an unknown source name.
    pub fn from(mut self, sources: &str) -> Self {
        for s in sources.split(',').filter(|s| !s.trim().is_empty()) {
            match Source::parse(s) {
                Some(src) => self.sources.push(src),
                None => panic!("field `{}`: unknown bind source `{}`", self.name, s.trim()),
            }
        }
        self
    }

    pub fn kind(mut self, kind: Kind) -> Self {
        self.kind = kind;
        self
    }

    /// Comma-separated steps: `trim`, `tolower`, `toupper`, `cut(N)`.
    pub fn process(mut self, ops: &str) -> Self {
        self.process.extend(Process::parse_list(ops));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Context {
    /// Binds the request into a fresh `T`.
    ///
    /// Malformed JSON, unconvertible values and deserialisation failures are
    /// reported as `400 Bad Request`.
    pub async fn bind<T: Bind>(&mut self) -> Result<T> {
        let mut object = Map::new();
        let is_json = self
            .header("content-type")
            .is_some_and(|ct| ct.starts_with("application/json"));
        if is_json && !self.body().is_empty() {
            match serde_json::from_slice::<Json>(self.body()) {
                Ok(Json::Object(map)) => object = map,
                Ok(_) => return Err(bad_request("json body is not an object")),
                Err(e) => return Err(HttpError::bad_request().with_internal(e).into()),
            }
        }

        self.bind_fields(&T::fields(), &mut object).await?;
        serde_json::from_value(Json::Object(object))
            .map_err(|e| HttpError::bad_request().with_internal(e).into())
    }

    fn bind_fields<'a>(
        &'a mut self,
        fields: &'a [Field],
        object: &'a mut Map<String, Json>,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            for field in fields {
                if let Some(inner) = &field.nested {
                    let mut sub = match object.remove(&field.name) {
                        Some(Json::Object(map)) => map,
                        _ => Map::new(),
                    };
                    self.bind_fields(inner, &mut sub).await?;
                    if !sub.is_empty() {
                        object.insert(field.name.clone(), Json::Object(sub));
                    }
                    continue;
                }
                if let Some(value) = self.lookup(field).await? {
                    object.insert(field.name.clone(), value);
                }
            }
            Ok(())
        })
    }

    /// First non-empty value across the field's sources, converted.
    async fn lookup(&mut self, field: &Field) -> Result<Option<Json>> {
        for &source in &field.sources {
            let raw: Option<Json> = match source {
                Source::Value => self.value(&field.name).and_then(|v| any_to_json(&v)),
                Source::Header => self.header(&field.name).map(|s| Json::String(s.to_owned())),
                Source::Param => {
                    let v = self.param(&field.name);
                    (!v.is_empty()).then(|| Json::String(v.to_owned()))
                }
                Source::Query => {
                    let values = self.query_params().get(&field.name).cloned();
                    values.map(|v| strings_to_json(v, &field.kind))
                }
                Source::Form if self.is_form() => {
                    let values = self.form().await?.values.get(&field.name).cloned();
                    values.map(|v| strings_to_json(v, &field.kind))
                }
                Source::Form => None,
                Source::File if self.is_form() => {
                    let file = self.form().await?.file(&field.name).cloned();
                    file.map(serde_json::to_value).transpose()?
                }
                Source::File => None,
                Source::Cookie => self.cookie(&field.name).map(Json::String),
            };
            let Some(raw) = raw else { continue };
            if is_empty(&raw) {
                continue;
            }
            return convert(raw, &field.kind, &field.process).map(Some);
        }
        Ok(None)
    }
}

fn bad_request(msg: &str) -> Error {
    HttpError::bad_request().with_internal(Error::msg(msg)).into()
}

fn is_empty(v: &Json) -> bool {
    match v {
        Json::Null => true,
        Json::String(s) => s.is_empty(),
        Json::Array(a) => a.is_empty() || a.iter().all(is_empty),
        _ => false,
    }
}

/// Repeated inputs stay a list; a single one stays a string.
fn strings_to_json(mut values: Vec<String>, kind: &Kind) -> Json {
    if values.len() == 1 || !matches!(kind, Kind::List(_)) {
        return Json::String(values.swap_remove(0));
    }
    Json::Array(values.into_iter().map(Json::String).collect())
}

fn any_to_json(v: &Value) -> Option<Json> {
    if let Some(s) = v.downcast_ref::<String>() {
        return Some(Json::String(s.clone()));
    }
    if let Some(s) = v.downcast_ref::<&'static str>() {
        return Some(Json::String((*s).to_owned()));
    }
    if let Some(j) = v.downcast_ref::<Json>() {
        return Some(j.clone());
    }
    if let Some(b) = v.downcast_ref::<bool>() {
        return Some(Json::Bool(*b));
    }
    macro_rules! numbers {
        ($($t:ty),*) => {
            $(if let Some(n) = v.downcast_ref::<$t>() {
                return Some(Json::from(*n));
            })*
        };
    }
    numbers!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64);
    None
}

/// The fixed conversion table from raw inputs to the field's kind.
fn convert(raw: Json, kind: &Kind, process: &[Process]) -> Result<Json> {
    match (kind, raw) {
        (Kind::Str, Json::String(s)) => {
            let s = process.iter().fold(s, |s, op| op.apply(s));
            Ok(Json::String(s))
        }
        (Kind::Int, Json::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Json::from)
            .map_err(|_| bad_request(&format!("`{s}` is not an integer"))),
        (Kind::Uint, Json::String(s)) => s
            .trim()
            .parse::<u64>()
            .map(Json::from)
            .map_err(|_| bad_request(&format!("`{s}` is not an unsigned integer"))),
        (Kind::Float, Json::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Json::Number)
            .ok_or_else(|| bad_request(&format!("`{s}` is not a number"))),
        (Kind::Bool, Json::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "t" | "true" | "on" | "yes" => Ok(Json::Bool(true)),
            "0" | "f" | "false" | "off" | "no" => Ok(Json::Bool(false)),
            _ => Err(bad_request(&format!("`{s}` is not a boolean"))),
        },
        (Kind::List(inner), Json::String(s)) => {
            let t = s.trim();
            if t.starts_with('[') {
                let parsed: Json = serde_json::from_str(t)
                    .map_err(|e| Error::from(HttpError::bad_request().with_internal(e)))?;
                return convert(parsed, kind, process);
            }
            let items = t
                .split(',')
                .filter(|p| !p.trim().is_empty())
                .map(|p| convert(Json::String(p.trim().to_owned()), inner, process))
                .collect::<Result<Vec<_>>>()?;
            Ok(Json::Array(items))
        }
        (Kind::List(inner), Json::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Json::String(_) => convert(item, inner, process),
                other => Ok(other),
            })
            .collect::<Result<Vec<_>>>()
            .map(Json::Array),
        (Kind::Json, Json::String(s)) => {
            serde_json::from_str(&s).map_err(|e| HttpError::bad_request().with_internal(e).into())
        }
        (Kind::File, v @ Json::Object(_)) => Ok(v),
        (Kind::File, _) => Err(bad_request("expected an uploaded file")),
        // Values already typed (store values, JSON arrays) pass through.
        (_, v) => Ok(v),
    }
}
