//! Template-backed entity bodies.
//!
//! The connector does not ship a template language. Applications plug one in
//! through [`TemplateEngine`]; the body is rendered when the response is
//! written, so rendering failures surface as write-time I/O faults.

use crate::{errors::Error, HandlerError, Request};
use memchr::memchr;
use serde_json::{Map, Value};
use std::{fmt, sync::Arc};

/// Language tag a template is rendered for, e.g. `en-US`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locale(String);

impl Locale {
    pub fn new(tag: impl Into<String>) -> Self {
        Locale(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Locale {
    fn default() -> Self {
        Locale("en".to_string())
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Renders a named template with a data model.
///
/// # Examples
/// ```
/// use conduit_http::{HandlerError, template::{Locale, TemplateEngine}};
/// use serde_json::{Map, Value};
///
/// struct Greeter;
///
/// impl TemplateEngine for Greeter {
///     fn render(
///         &self,
///         name: &str,
///         _: &Locale,
///         variables: &Map<String, Value>,
///     ) -> Result<String, HandlerError> {
///         match (name, variables.get("who").and_then(Value::as_str)) {
///             ("hello", Some(who)) => Ok(format!("Hello, {who}!")),
///             _ => Err(format!("cannot render `{name}`").into()),
///         }
///     }
/// }
/// ```
pub trait TemplateEngine: Send + Sync {
    fn render(
        &self,
        name: &str,
        locale: &Locale,
        variables: &Map<String, Value>,
    ) -> Result<String, HandlerError>;
}

/// Entity body produced by a [`TemplateEngine`] at write time.
#[derive(Clone)]
pub struct TemplateBody {
    engine: Arc<dyn TemplateEngine>,
    name: String,
    locale: Locale,
    variables: Map<String, Value>,
}

impl TemplateBody {
    pub fn new(engine: Arc<dyn TemplateEngine>, name: impl Into<String>) -> Self {
        TemplateBody {
            engine,
            name: name.into(),
            locale: Locale::default(),
            variables: Map::new(),
        }
    }

    pub fn locale(mut self, locale: Locale) -> Self {
        self.locale = locale;
        self
    }

    /// Adds one variable to the data model.
    pub fn variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// Replaces the data model.
    pub fn variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = variables;
        self
    }

    /// Fills the data model from an `application/x-www-form-urlencoded`
    /// request body. The first occurrence of a field wins.
    pub fn form_data(mut self, request: &Request) -> Self {
        let mut variables = Map::new();

        for (name, value) in read_form(request.body()) {
            if !variables.contains_key(&name) {
                variables.insert(name, Value::String(value));
            }
        }

        self.variables = variables;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn render(&self) -> Result<String, Error> {
        self.engine
            .render(&self.name, &self.locale, &self.variables)
            .map_err(|error| {
                tracing::warn!(template = %self.name, %error, "unable to process the template");
                Error::template(error)
            })
    }
}

impl fmt::Debug for TemplateBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplateBody")
            .field("name", &self.name)
            .field("locale", &self.locale)
            .field("variables", &self.variables)
            .finish_non_exhaustive()
    }
}

/// Splits a urlencoded form into decoded `(name, value)` pairs.
fn read_form(body: &[u8]) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut rest = body;

    while !rest.is_empty() {
        let end = memchr(b'&', rest).unwrap_or(rest.len());
        let pair = &rest[..end];
        rest = rest.get(end + 1..).unwrap_or_default();

        if pair.is_empty() {
            continue;
        }

        let (name, value) = match memchr(b'=', pair) {
            Some(eq) => (&pair[..eq], &pair[eq + 1..]),
            None => (pair, &b""[..]),
        };
        pairs.push((decode_component(name), decode_component(value)));
    }

    pairs
}

fn decode_component(src: &[u8]) -> String {
    let mut out = Vec::with_capacity(src.len());
    let mut i = 0;

    while i < src.len() {
        match src[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < src.len() => {
                match (hex_value(src[i + 1]), hex_value(src[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 2;
                    }
                    _ => out.push(b'%'),
                }
            }
            byte => out.push(byte),
        }
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

#[inline(always)]
fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
