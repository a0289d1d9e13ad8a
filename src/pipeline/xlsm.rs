//! Cell overlay for macro-enabled workbooks.
//!
//! A `.xlsm` is a zip of XML parts plus an opaque `xl/vbaProject.bin`. The
//! overlay rewrites only the worksheet parts that receive values; every
//! other entry (macros included) is raw-copied, so nothing outside the
//! touched cells changes.
//!
//! ```text
//! workbook.xml        sheet name ──▶ r:id
//! workbook.xml.rels   r:id       ──▶ worksheets/sheetN.xml
//! sheetN.xml          <sheetData> rows/cells patched in place
//! calcChain.xml       dropped (stale once cached values change)
//! ```
//!
//! Written cells keep their style index (`s`). Strings are written inline
//! (`t="inlineStr"`) so the shared-strings table is never touched. A `null`
//! value clears the cell while keeping its style.

use crate::request::CellWrite;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read, Write};
use thiserror::Error;
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const WORKBOOK: &str = "xl/workbook.xml";
const WORKBOOK_RELS: &str = "xl/_rels/workbook.xml.rels";
const CONTENT_TYPES: &str = "[Content_Types].xml";
const CALC_CHAIN: &str = "xl/calcChain.xml";

static ATTR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([\w:]+)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("static regex"));
static SHEET_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<sheet\b[^>]*>").expect("static regex"));
static REL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<Relationship\b[^>]*>").expect("static regex"));
static SHEET_DATA_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<sheetData\b[^>]*?(?:/>|>(.*?)</sheetData>)").expect("static regex")
});
static ROW_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<row\b([^>]*?)(?:/>|>(.*?)</row>)").expect("static regex"));
static CELL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<c\b([^>]*?)(?:/>|>(.*?)</c>)").expect("static regex"));
static SPANS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\s+spans="[^"]*""#).expect("static regex"));
static CALC_OVERRIDE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<Override\b[^>]*PartName="/xl/calcChain\.xml"[^>]*/>"#).expect("static regex")
});
static CALC_REL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<Relationship\b[^>]*Target="[^"]*calcChain\.xml"[^>]*/>"#).expect("static regex")
});
static CALC_PR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<calcPr\b([^>]*?)(/?)>").expect("static regex"));

#[derive(Debug, Error)]
pub enum XlsmError {
    #[error("invalid workbook archive: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("workbook part missing: {0}")]
    MissingPart(String),
    #[error("sheet not found: {0}")]
    UnknownSheet(String),
    #[error("malformed worksheet {0}")]
    Malformed(String),
}

/// Spreadsheet column letters for a 1-based index (`1 → A`, `28 → AB`).
pub fn column_letters(mut col: u32) -> String {
    let mut out = Vec::new();
    while col > 0 {
        let rem = (col - 1) % 26;
        out.push(b'A' + rem as u8);
        col = (col - 1) / 26;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Inverse of [`column_letters`] for the letter prefix of a cell reference.
fn column_index(reference: &str) -> Option<u32> {
    let letters: String = reference.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    if letters.is_empty() {
        return None;
    }
    Some(
        letters
            .to_ascii_uppercase()
            .bytes()
            .fold(0u32, |acc, b| acc * 26 + u32::from(b - b'A' + 1)),
    )
}

fn attrs(tag: &str) -> HashMap<String, String> {
    ATTR_RE
        .captures_iter(tag)
        .map(|c| {
            let value = c.get(2).or_else(|| c.get(3)).map_or("", |m| m.as_str());
            (c[1].to_string(), unescape(value))
        })
        .collect()
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Apply `writes` to the workbook in `template` and return the new archive.
pub fn overlay(template: &[u8], writes: &[CellWrite]) -> Result<Vec<u8>, XlsmError> {
    let mut archive = ZipArchive::new(Cursor::new(template))?;
    let workbook = read_entry(&mut archive, WORKBOOK)?;
    let rels = read_entry(&mut archive, WORKBOOK_RELS)?;

    let mut by_sheet: BTreeMap<&str, Vec<&CellWrite>> = BTreeMap::new();
    for w in writes {
        by_sheet.entry(w.sheet.as_str()).or_default().push(w);
    }

    let mut patched: HashMap<String, String> = HashMap::new();
    for (sheet, cells) in by_sheet {
        let part = sheet_part(&workbook, &rels, sheet)?;
        let xml = match patched.remove(&part) {
            Some(xml) => xml,
            None => read_entry(&mut archive, &part)?,
        };
        let xml = patch_sheet(&xml, &cells).ok_or_else(|| XlsmError::Malformed(part.clone()))?;
        debug!("Workbook overlay: {} cell(s) on '{}' ({})", cells.len(), sheet, part);
        patched.insert(part, xml);
    }

    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for i in 0..archive.len() {
        let name = archive.by_index_raw(i)?.name().to_string();
        if name == CALC_CHAIN {
            continue;
        }
        let rewritten = match name.as_str() {
            CONTENT_TYPES => {
                let types = read_entry(&mut archive, &name)?;
                Some(CALC_OVERRIDE_RE.replace_all(&types, "").into_owned())
            }
            WORKBOOK_RELS => Some(CALC_REL_RE.replace_all(&rels, "").into_owned()),
            WORKBOOK => Some(force_full_calc(&workbook)),
            _ => patched.remove(&name),
        };
        match rewritten {
            Some(xml) => {
                writer.start_file(name, options)?;
                writer.write_all(xml.as_bytes())?;
            }
            None => {
                let file = archive.by_index_raw(i)?;
                writer.raw_copy_file(file)?;
            }
        }
    }
    Ok(writer.finish()?.into_inner())
}

fn read_entry(archive: &mut ZipArchive<Cursor<&[u8]>>, name: &str) -> Result<String, XlsmError> {
    let mut file = match archive.by_name(name) {
        Ok(f) => f,
        Err(zip::result::ZipError::FileNotFound) => return Err(XlsmError::MissingPart(name.to_string())),
        Err(e) => return Err(e.into()),
    };
    let mut out = String::new();
    file.read_to_string(&mut out)?;
    Ok(out)
}

/// Resolve a sheet's display name to its part path inside the archive.
fn sheet_part(workbook: &str, rels: &str, sheet: &str) -> Result<String, XlsmError> {
    let rid = SHEET_RE
        .find_iter(workbook)
        .map(|m| attrs(m.as_str()))
        .find(|a| a.get("name").map(String::as_str) == Some(sheet))
        .and_then(|a| a.get("r:id").cloned())
        .ok_or_else(|| XlsmError::UnknownSheet(sheet.to_string()))?;

    let target = REL_RE
        .find_iter(rels)
        .map(|m| attrs(m.as_str()))
        .find(|a| a.get("Id") == Some(&rid))
        .and_then(|a| a.get("Target").cloned())
        .ok_or_else(|| XlsmError::MissingPart(format!("relationship {rid}")))?;

    Ok(match target.strip_prefix('/') {
        Some(absolute) => absolute.to_string(),
        None => format!("xl/{target}"),
    })
}

/// Ask the spreadsheet app to recompute on open; cached results are stale.
fn force_full_calc(workbook: &str) -> String {
    CALC_PR_RE
        .replace(workbook, |c: &regex::Captures| {
            if c[1].contains("fullCalcOnLoad") {
                c[0].to_string()
            } else {
                format!("<calcPr{} fullCalcOnLoad=\"1\"{}>", &c[1], &c[2])
            }
        })
        .into_owned()
}

struct Row {
    num: u32,
    attrs: String,
    cells: BTreeMap<u32, String>,
}

/// Patch `writes` into one worksheet's `<sheetData>`.
fn patch_sheet(xml: &str, writes: &[&CellWrite]) -> Option<String> {
    let data = SHEET_DATA_RE.captures(xml)?;
    let whole = data.get(0)?;
    let inner = data.get(1).map_or("", |m| m.as_str());

    let mut rows: BTreeMap<u32, Row> = BTreeMap::new();
    let mut last_row = 0;
    for cap in ROW_RE.captures_iter(inner) {
        let raw_attrs = cap.get(1).map_or("", |m| m.as_str());
        let num = attrs(raw_attrs)
            .get("r")
            .and_then(|r| r.parse().ok())
            .unwrap_or(last_row + 1);
        last_row = num;

        let mut cells = BTreeMap::new();
        let mut last_col = 0;
        for c in CELL_RE.captures_iter(cap.get(2).map_or("", |m| m.as_str())) {
            let col = attrs(c.get(1).map_or("", |m| m.as_str()))
                .get("r")
                .and_then(|r| column_index(r))
                .unwrap_or(last_col + 1);
            last_col = col;
            cells.insert(col, c[0].to_string());
        }
        rows.insert(
            num,
            Row {
                num,
                attrs: raw_attrs.to_string(),
                cells,
            },
        );
    }

    for w in writes {
        let row = rows.entry(w.row).or_insert_with(|| Row {
            num: w.row,
            attrs: format!(" r=\"{}\"", w.row),
            cells: BTreeMap::new(),
        });
        let style = row
            .cells
            .get(&w.col)
            .and_then(|existing| CELL_RE.captures(existing))
            .and_then(|c| attrs(c.get(1).map_or("", |m| m.as_str())).remove("s"));
        row.cells.insert(w.col, render_cell(w.row, w.col, style.as_deref(), &w.value));
        row.attrs = SPANS_RE.replace_all(&row.attrs, "").into_owned();
    }

    let mut body = String::from("<sheetData>");
    for row in rows.values() {
        if row.cells.is_empty() {
            body.push_str(&format!("<row{}/>", row.attrs));
            continue;
        }
        body.push_str(&format!("<row{}>", row.attrs));
        for cell in row.cells.values() {
            body.push_str(cell);
        }
        body.push_str("</row>");
    }
    body.push_str("</sheetData>");
    debug!(
        "Patched sheet: {} row(s), last row {}",
        rows.len(),
        rows.values().last().map_or(0, |r| r.num)
    );

    let mut out = String::with_capacity(xml.len() + body.len());
    out.push_str(&xml[..whole.start()]);
    out.push_str(&body);
    out.push_str(&xml[whole.end()..]);
    Some(out)
}

fn render_cell(row: u32, col: u32, style: Option<&str>, value: &Value) -> String {
    let reference = format!("{}{}", column_letters(col), row);
    let s = style.map(|s| format!(" s=\"{}\"", escape(s))).unwrap_or_default();
    match value {
        Value::Null => format!("<c r=\"{reference}\"{s}/>"),
        Value::Bool(b) => format!("<c r=\"{reference}\"{s} t=\"b\"><v>{}</v></c>", u8::from(*b)),
        Value::Number(n) => format!("<c r=\"{reference}\"{s}><v>{n}</v></c>"),
        Value::String(text) => inline_string(&reference, &s, text),
        other => inline_string(&reference, &s, &other.to_string()),
    }
}

fn inline_string(reference: &str, style: &str, text: &str) -> String {
    format!(
        "<c r=\"{reference}\"{style} t=\"inlineStr\"><is><t xml:space=\"preserve\">{}</t></is></c>",
        escape(text)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const VBA: &[u8] = b"\xd0\xcf\x11\xe0 fake macro storage";

    fn template() -> Vec<u8> {
        let parts: [(&str, &[u8]); 7] = [
            (
                CONTENT_TYPES,
                br#"<Types><Override PartName="/xl/workbook.xml" ContentType="wb"/><Override PartName="/xl/calcChain.xml" ContentType="cc"/></Types>"#,
            ),
            (
                WORKBOOK,
                br#"<workbook><sheets><sheet name="Cover" sheetId="1" r:id="rId1"/><sheet name="Gastos &amp; Totales" sheetId="2" r:id="rId2"/></sheets><calcPr calcId="191029"/></workbook>"#,
            ),
            (
                WORKBOOK_RELS,
                br#"<Relationships><Relationship Id="rId1" Target="worksheets/sheet1.xml"/><Relationship Id="rId2" Target="/xl/worksheets/sheet2.xml"/><Relationship Id="rId3" Target="calcChain.xml"/></Relationships>"#,
            ),
            ("xl/worksheets/sheet1.xml", br#"<worksheet><sheetData/></worksheet>"#),
            (
                "xl/worksheets/sheet2.xml",
                br#"<worksheet><dimension ref="A1:C1"/><sheetData><row r="1" spans="1:3"><c r="A1" s="3"><v>1</v></c><c r="C1" t="s"><v>0</v></c></row></sheetData></worksheet>"#,
            ),
            (CALC_CHAIN, br#"<calcChain><c r="C1" i="2"/></calcChain>"#),
            ("xl/vbaProject.bin", VBA),
        ];
        let mut w = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, bytes) in parts {
            w.start_file(name, SimpleFileOptions::default()).unwrap();
            w.write_all(bytes).unwrap();
        }
        w.finish().unwrap().into_inner()
    }

    fn cell(sheet: &str, row: u32, col: u32, value: Value) -> CellWrite {
        CellWrite {
            sheet: sheet.into(),
            row,
            col,
            value,
        }
    }

    fn entry(bytes: &[u8], name: &str) -> Option<Vec<u8>> {
        let mut a = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut f = a.by_name(name).ok()?;
        let mut out = Vec::new();
        f.read_to_end(&mut out).unwrap();
        Some(out)
    }

    fn text(bytes: &[u8], name: &str) -> String {
        String::from_utf8(entry(bytes, name).unwrap()).unwrap()
    }

    #[test]
    fn column_letters_roundtrip_edges() {
        assert_eq!(column_letters(1), "A");
        assert_eq!(column_letters(26), "Z");
        assert_eq!(column_letters(27), "AA");
        assert_eq!(column_letters(703), "AAA");
        assert_eq!(column_index("AB12"), Some(28));
        assert_eq!(column_index("12"), None);
    }

    #[test]
    fn cells_are_patched_in_order_keeping_style() {
        let out = overlay(
            &template(),
            &[
                cell("Gastos & Totales", 1, 2, json!("Total & más")),
                cell("Gastos & Totales", 1, 1, json!(42.5)),
                cell("Gastos & Totales", 4, 1, json!(true)),
            ],
        )
        .unwrap();

        let sheet = text(&out, "xl/worksheets/sheet2.xml");
        assert!(sheet.contains(
            r#"<row r="1"><c r="A1" s="3"><v>42.5</v></c><c r="B1" t="inlineStr"><is><t xml:space="preserve">Total &amp; más</t></is></c><c r="C1" t="s"><v>0</v></c></row>"#
        ));
        assert!(sheet.contains(r#"<row r="4"><c r="A4" t="b"><v>1</v></c></row>"#));
        assert!(sheet.starts_with(r#"<worksheet><dimension ref="A1:C1"/>"#));
    }

    #[test]
    fn macros_survive_and_calc_chain_is_dropped() {
        let out = overlay(&template(), &[cell("Cover", 2, 3, json!("x"))]).unwrap();
        assert_eq!(entry(&out, "xl/vbaProject.bin").unwrap(), VBA);
        assert!(entry(&out, CALC_CHAIN).is_none());
        assert!(!text(&out, CONTENT_TYPES).contains("calcChain"));
        assert!(!text(&out, WORKBOOK_RELS).contains("calcChain"));
        assert!(text(&out, WORKBOOK).contains(r#"<calcPr calcId="191029" fullCalcOnLoad="1"/>"#));
        assert!(text(&out, "xl/worksheets/sheet1.xml").contains(r#"<c r="C2" t="inlineStr">"#));
    }

    #[test]
    fn null_clears_value() {
        let out = overlay(&template(), &[cell("Gastos & Totales", 1, 1, Value::Null)]).unwrap();
        assert!(text(&out, "xl/worksheets/sheet2.xml").contains(r#"<c r="A1" s="3"/>"#));
    }

    #[test]
    fn unknown_sheet_and_bad_archive_fail() {
        assert!(matches!(
            overlay(&template(), &[cell("Nope", 1, 1, json!(1))]),
            Err(XlsmError::UnknownSheet(s)) if s == "Nope"
        ));
        assert!(matches!(overlay(b"not a zip", &[]), Err(XlsmError::Zip(_))));
    }
}
