use sandbox::FormatHint;

/// How many leading bytes are inspected when sniffing content.
const SNIFF_BYTES: usize = 8192;

/// Infer a format hint from magic bytes, the file extension, the declared
/// content type, and finally the content itself. Deterministic in its inputs.
pub fn infer(name: &str, content_type: Option<&str>, bytes: &[u8]) -> FormatHint {
    let ext = extension(name);
    let head = bytes.get(..SNIFF_BYTES).unwrap_or(bytes);

    if head.starts_with(b"PAR1") {
        return FormatHint::Tabular;
    }
    if head.starts_with(b"PK\x03\x04") {
        return match ext.as_deref() {
            Some("xlsx" | "xlsm" | "ods") => FormatHint::Tabular,
            _ => FormatHint::Binary,
        };
    }
    if head.starts_with(&[0xD0, 0xCF, 0x11, 0xE0]) && ext.as_deref() == Some("xls") {
        return FormatHint::Tabular;
    }
    if looks_binary(head) {
        return FormatHint::Binary;
    }

    if let Some(hint) = ext.as_deref().and_then(hint_for_extension) {
        return hint;
    }
    if let Some(hint) = content_type.and_then(hint_for_content_type) {
        return hint;
    }

    match head.iter().find(|b| !b.is_ascii_whitespace()) {
        Some(b'{' | b'[' | b'<') => FormatHint::SemiStructured,
        _ => FormatHint::DelimitedText,
    }
}

fn extension(name: &str) -> Option<String> {
    let base = name.rsplit('/').next().unwrap_or(name);
    base.rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
}

fn hint_for_extension(ext: &str) -> Option<FormatHint> {
    match ext {
        "csv" | "tsv" | "parquet" | "xlsx" | "xls" => Some(FormatHint::Tabular),
        "json" | "jsonl" | "ndjson" | "geojson" | "xml" | "yaml" | "yml" => {
            Some(FormatHint::SemiStructured)
        }
        "txt" | "log" | "dat" | "psv" => Some(FormatHint::DelimitedText),
        _ => None,
    }
}

fn hint_for_content_type(content_type: &str) -> Option<FormatHint> {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "text/csv" | "text/tab-separated-values" | "application/vnd.apache.parquet" => {
            Some(FormatHint::Tabular)
        }
        "application/json" | "application/x-ndjson" | "application/xml" | "text/xml" => {
            Some(FormatHint::SemiStructured)
        }
        "text/plain" => Some(FormatHint::DelimitedText),
        _ => None,
    }
}

/// NUL bytes or invalid UTF-8 in the sniffed prefix. A multi-byte sequence
/// cut off by the prefix boundary does not count.
fn looks_binary(head: &[u8]) -> bool {
    if head.contains(&0) {
        return true;
    }
    match std::str::from_utf8(head) {
        Ok(_) => false,
        Err(e) => e.error_len().is_some(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_wins_for_text() {
        assert_eq!(infer("sales.csv", None, b"a,b\n1,2\n"), FormatHint::Tabular);
        assert_eq!(infer("dir/Events.JSONL", None, b"{}\n"), FormatHint::SemiStructured);
        assert_eq!(infer("notes.txt", None, b"[not json"), FormatHint::DelimitedText);
    }

    #[test]
    fn magic_bytes_beat_extension() {
        assert_eq!(infer("data.bin", None, b"PAR1\x00\x00"), FormatHint::Tabular);
        assert_eq!(infer("book.xlsx", None, b"PK\x03\x04rest"), FormatHint::Tabular);
        assert_eq!(infer("archive.zip", None, b"PK\x03\x04rest"), FormatHint::Binary);
        assert_eq!(infer("fake.csv", None, b"a,b\x00\x01"), FormatHint::Binary);
        assert_eq!(infer("bad.csv", None, &[0x61, 0xff, 0xfe]), FormatHint::Binary);
    }

    #[test]
    fn falls_back_to_content_type_then_content() {
        assert_eq!(
            infer("export", Some("text/csv; charset=utf-8"), b"a,b"),
            FormatHint::Tabular
        );
        assert_eq!(infer("payload", None, b"  {\"a\": 1}"), FormatHint::SemiStructured);
        assert_eq!(infer("readings", None, b"1 2 3\n4 5 6\n"), FormatHint::DelimitedText);
    }

    #[test]
    fn truncated_utf8_at_sniff_boundary_is_text() {
        let mut bytes = vec![b'a'; SNIFF_BYTES - 1];
        bytes.extend_from_slice("é".as_bytes());
        assert_eq!(infer("long.log", None, &bytes), FormatHint::DelimitedText);
    }

    #[test]
    fn inference_is_stable() {
        let bytes = b"x,y\n1,2\n";
        assert_eq!(infer("a.csv", None, bytes), infer("a.csv", None, bytes));
    }
}
