//! Header allow-list for tunneled requests

use std::collections::BTreeMap;

/// Request headers forwarded to agents. Everything else is stripped.
pub const FORWARDED_HEADERS: &[&str] = &["authorization", "content-type"];

/// Keep only allow-listed headers, with lower-cased names.
///
/// When a header repeats, the first occurrence wins.
pub fn filter_forwarded_headers<'a, I>(headers: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut forwarded = BTreeMap::new();
    for (name, value) in headers {
        let name = name.to_ascii_lowercase();
        if FORWARDED_HEADERS.contains(&name.as_str()) {
            forwarded.entry(name).or_insert_with(|| value.to_string());
        }
    }
    forwarded
}
