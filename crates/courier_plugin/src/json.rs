use std::fmt;

use serde::Serialize;
use serde_json::Value;

/// Renders a value as compact JSON when displayed, and only then.
///
/// Strings are written verbatim, so `%json(&"abc")` logs `abc` and not `"abc"`.
///
/// ```ignore
/// tracing::debug!(payload = %json(&message.payload), "step finished");
/// ```
pub struct Json<'a, T: ?Sized>(&'a T);

pub fn json<T: Serialize + ?Sized>(value: &T) -> Json<'_, T> {
    Json(value)
}

impl<T: Serialize + ?Sized> fmt::Display for Json<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_value(self.0) {
            Ok(Value::String(s)) => f.write_str(&s),
            Ok(value) => write!(f, "{value}"),
            Err(err) => write!(f, "<unrenderable: {err}>"),
        }
    }
}

impl<T: Serialize + ?Sized> fmt::Debug for Json<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
