/// Default key expression prefix for battery telemetry.
pub const KEY_PREFIX: &str = "batmon/bms";

/// Builder for constructing batmon key expressions.
///
/// Key expressions follow the pattern:
/// `<prefix>/<device_topic>/<field_path>`
#[derive(Debug, Clone)]
pub struct KeyExprBuilder {
    prefix: String,
}

impl Default for KeyExprBuilder {
    fn default() -> Self {
        Self::new(KEY_PREFIX)
    }
}

impl KeyExprBuilder {
    /// Create a builder with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix: String = prefix.into();
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    /// The prefix this builder prepends.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Build a key expression for a device field.
    ///
    /// # Example
    /// ```
    /// use batmon_common::keyexpr::KeyExprBuilder;
    ///
    /// let builder = KeyExprBuilder::new("batmon/bms");
    /// let key = builder.build("house", "cell_voltages/3");
    /// assert_eq!(key, "batmon/bms/house/cell_voltages/3");
    /// ```
    pub fn build(&self, device_topic: &str, field: &str) -> String {
        format!("{}/{}/{}", self.prefix, device_topic, field)
    }

    /// Build a wildcard key expression for all fields of a device.
    ///
    /// # Example
    /// ```
    /// use batmon_common::keyexpr::KeyExprBuilder;
    ///
    /// let builder = KeyExprBuilder::new("batmon/bms");
    /// assert_eq!(builder.device_wildcard("house"), "batmon/bms/house/**");
    /// ```
    pub fn device_wildcard(&self, device_topic: &str) -> String {
        format!("{}/{}/**", self.prefix, device_topic)
    }

    /// Key expression for bridge status.
    pub fn status_key(&self) -> String {
        format!("{}/@/status", self.prefix)
    }

    /// Key expression for the bridge health snapshot.
    pub fn health_key(&self) -> String {
        format!("{}/@/health", self.prefix)
    }
}

/// Turn a device alias or address into a topic segment.
///
/// Every character outside `[A-Za-z0-9_.-/]` becomes `_`, so MAC addresses
/// like `C8:47:8C:00:00:01` map to `C8_47_8C_00_00_01`. Empty chunks are
/// dropped, since zenoh rejects `//` and leading or trailing `/`. The result
/// is empty only when the name has no chunk left.
///
/// # Example
/// ```
/// use batmon_common::keyexpr::sanitize_topic;
///
/// assert_eq!(sanitize_topic("Daly BMS #1"), "Daly_BMS__1");
/// assert_eq!(sanitize_topic("/rack//top/"), "rack/top");
/// ```
pub fn sanitize_topic(name: &str) -> String {
    name.split('/')
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| {
            chunk
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                        c
                    } else {
                        '_'
                    }
                })
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Parse a key expression back into device topic and field path.
///
/// Returns `None` if the key does not start with `prefix` or lacks a field.
pub fn parse_key_expr<'a>(prefix: &str, key: &'a str) -> Option<ParsedKeyExpr<'a>> {
    let rest = key.strip_prefix(prefix.trim_end_matches('/'))?;
    let rest = rest.strip_prefix('/')?;

    let (device, field) = rest.split_once('/')?;
    if device.is_empty() || field.is_empty() || device == "@" {
        return None;
    }

    Some(ParsedKeyExpr { device, field })
}

/// Parsed components of a batmon key expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKeyExpr<'a> {
    pub device: &'a str,
    pub field: &'a str,
}
