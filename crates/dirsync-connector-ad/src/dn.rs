//! Distinguished name helpers (RFC 4514).

/// Byte index of the first unescaped comma, if any.
fn first_separator(dn: &str) -> Option<usize> {
    let mut escaped = false;
    for (i, ch) in dn.char_indices() {
        match ch {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            ',' => return Some(i),
            _ => {}
        }
    }
    None
}

/// Split a DN into its leading RDN and the parent DN (empty for a root).
pub fn split_rdn(dn: &str) -> (&str, &str) {
    match first_separator(dn) {
        Some(i) => (dn[..i].trim(), dn[i + 1..].trim()),
        None => (dn.trim(), ""),
    }
}

/// Parent DN, `None` for a single-RDN name.
pub fn parent_dn(dn: &str) -> Option<&str> {
    let (_, parent) = split_rdn(dn);
    (!parent.is_empty()).then_some(parent)
}

/// Leading RDN, e.g. `CN=John Doe` for `CN=John Doe,OU=Staff,DC=corp`.
pub fn relative_name(dn: &str) -> &str {
    split_rdn(dn).0
}

/// Attribute type and unescaped value of an RDN.
pub fn rdn_parts(rdn: &str) -> Option<(&str, String)> {
    let (attr, value) = rdn.split_once('=')?;
    let attr = attr.trim();
    if attr.is_empty() {
        return None;
    }
    Some((attr, unescape_dn_value(value.trim())))
}

/// Escape an attribute value for use inside an RDN.
pub fn escape_dn_value(value: &str) -> String {
    let last = value.chars().count().saturating_sub(1);
    let mut out = String::with_capacity(value.len() * 2);
    for (i, ch) in value.chars().enumerate() {
        match ch {
            ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=' => {
                out.push('\\');
                out.push(ch);
            }
            '\0' => out.push_str("\\00"),
            '\n' => out.push_str("\\0A"),
            ' ' if i == 0 || i == last => out.push_str("\\20"),
            '#' if i == 0 => out.push_str("\\23"),
            _ => out.push(ch),
        }
    }
    out
}

/// Undo RFC 4514 escaping (`\,` and `\2c` both yield `,`).
pub fn unescape_dn_value(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 1 < bytes.len() {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok());
            match hex {
                Some(b) => {
                    out.push(b);
                    i += 3;
                }
                None => {
                    out.push(bytes[i + 1]);
                    i += 2;
                }
            }
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Canonical form for comparing DNs: lowercase, no blanks around separators.
pub fn normalize(dn: &str) -> String {
    let mut parts = Vec::new();
    let mut rest = dn.trim();
    loop {
        let (rdn, parent) = split_rdn(rest);
        let rdn = match rdn.split_once('=') {
            Some((a, v)) => format!("{}={}", a.trim(), v.trim()),
            None => rdn.to_string(),
        };
        parts.push(rdn.to_lowercase());
        if parent.is_empty() {
            break;
        }
        rest = parent;
    }
    parts.join(",")
}

/// Whether two DNs name the same entry.
pub fn same_dn(a: &str, b: &str) -> bool {
    normalize(a) == normalize(b)
}

/// Whether `dn` lies strictly below `ancestor`.
pub fn is_descendant(dn: &str, ancestor: &str) -> bool {
    let dn = normalize(dn);
    let ancestor = normalize(ancestor);
    if ancestor.is_empty() {
        return !dn.is_empty();
    }
    dn.len() > ancestor.len() + 1 && dn.ends_with(&format!(",{ancestor}"))
}

/// Number of RDNs in a DN.
pub fn depth(dn: &str) -> usize {
    if dn.trim().is_empty() {
        return 0;
    }
    let mut count = 1;
    let mut rest = dn;
    while let Some(parent) = parent_dn(rest) {
        count += 1;
        rest = parent;
    }
    count
}

/// Domain components of a DNS domain as a DN: `corp.example` → `DC=corp,DC=example`.
pub fn domain_to_dn(domain: &str) -> String {
    domain
        .split('.')
        .filter(|label| !label.is_empty())
        .map(|label| format!("DC={label}"))
        .collect::<Vec<_>>()
        .join(",")
}
