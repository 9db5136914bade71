//! Minimal .xlsx writer.
//!
//! An xlsx file is a zip container of SpreadsheetML parts. This writes the
//! smallest part set Excel and LibreOffice accept: content types, package
//! rels, workbook + rels, a stylesheet stub, and one worksheet per sheet
//! with inline strings (no shared-string table).

use anyhow::Context;
use std::fs::File;
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

#[derive(Debug, Clone)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
}

impl Cell {
    pub fn text(s: impl Into<String>) -> Cell {
        Cell::Text(s.into())
    }
}

#[derive(Debug, Clone)]
pub struct Sheet {
    name: String,
    rows: Vec<Vec<Cell>>,
}

impl Sheet {
    pub fn new(name: impl Into<String>) -> Sheet {
        Sheet {
            name: name.into(),
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, cells: Vec<Cell>) {
        self.rows.push(cells);
    }

    pub fn push_empty_row(&mut self) {
        self.rows.push(Vec::new());
    }

    fn to_xml(&self) -> String {
        let mut out = String::with_capacity(1024);
        out.push_str(r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#);
        out.push_str(
            r#"<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>"#,
        );
        for (ri, row) in self.rows.iter().enumerate() {
            let r = ri + 1;
            out.push_str(&format!(r#"<row r="{}">"#, r));
            for (ci, cell) in row.iter().enumerate() {
                let cell_ref = format!("{}{}", column_name(ci), r);
                match cell {
                    Cell::Empty => {}
                    Cell::Text(s) => {
                        out.push_str(&format!(
                            r#"<c r="{}" t="inlineStr"><is><t xml:space="preserve">{}</t></is></c>"#,
                            cell_ref,
                            xml_escape(s)
                        ));
                    }
                    Cell::Number(n) => {
                        out.push_str(&format!(r#"<c r="{}"><v>{}</v></c>"#, cell_ref, n));
                    }
                }
            }
            out.push_str("</row>");
        }
        out.push_str("</sheetData></worksheet>");
        out
    }
}

#[derive(Debug, Default)]
pub struct Workbook {
    sheets: Vec<Sheet>,
}

impl Workbook {
    pub fn new() -> Workbook {
        Workbook::default()
    }

    pub fn add_sheet(&mut self, sheet: Sheet) {
        self.sheets.push(sheet);
    }

    pub fn save(&self, out_path: &Path) -> anyhow::Result<()> {
        if self.sheets.is_empty() {
            anyhow::bail!("workbook must contain at least one sheet");
        }
        if let Some(parent) = out_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create directory {}", parent.to_string_lossy())
                })?;
            }
        }

        let out_file = File::create(out_path).with_context(|| {
            format!(
                "failed to create output file {}",
                out_path.to_string_lossy()
            )
        })?;
        let mut zip = ZipWriter::new(out_file);
        let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

        let entry = |zip: &mut ZipWriter<File>, name: &str, body: &str| -> anyhow::Result<()> {
            zip.start_file(name, opts)
                .with_context(|| format!("failed to start entry {}", name))?;
            use std::io::Write;
            zip.write_all(body.as_bytes())
                .with_context(|| format!("failed to write entry {}", name))?;
            Ok(())
        };

        entry(&mut zip, "[Content_Types].xml", &self.content_types_xml())?;
        entry(&mut zip, "_rels/.rels", PACKAGE_RELS)?;
        entry(&mut zip, "xl/workbook.xml", &self.workbook_xml())?;
        entry(&mut zip, "xl/_rels/workbook.xml.rels", &self.workbook_rels_xml())?;
        entry(&mut zip, "xl/styles.xml", STYLES_XML)?;
        for (i, sheet) in self.sheets.iter().enumerate() {
            entry(
                &mut zip,
                &format!("xl/worksheets/sheet{}.xml", i + 1),
                &sheet.to_xml(),
            )?;
        }

        zip.finish().context("failed to finalize workbook")?;
        Ok(())
    }

    fn content_types_xml(&self) -> String {
        let mut out = String::new();
        out.push_str(r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#);
        out.push_str(
            r#"<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types">"#,
        );
        out.push_str(
            r#"<Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/>"#,
        );
        out.push_str(r#"<Default Extension="xml" ContentType="application/xml"/>"#);
        out.push_str(
            r#"<Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/>"#,
        );
        out.push_str(
            r#"<Override PartName="/xl/styles.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.styles+xml"/>"#,
        );
        for i in 0..self.sheets.len() {
            out.push_str(&format!(
                r#"<Override PartName="/xl/worksheets/sheet{}.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/>"#,
                i + 1
            ));
        }
        out.push_str("</Types>");
        out
    }

    fn workbook_xml(&self) -> String {
        let mut out = String::new();
        out.push_str(r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#);
        out.push_str(
            r#"<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets>"#,
        );
        for (i, sheet) in self.sheets.iter().enumerate() {
            out.push_str(&format!(
                r#"<sheet name="{}" sheetId="{}" r:id="rId{}"/>"#,
                xml_escape(&sheet.name),
                i + 1,
                i + 1
            ));
        }
        out.push_str("</sheets></workbook>");
        out
    }

    fn workbook_rels_xml(&self) -> String {
        let mut out = String::new();
        out.push_str(r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#);
        out.push_str(
            r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
        );
        for i in 0..self.sheets.len() {
            out.push_str(&format!(
                r#"<Relationship Id="rId{}" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet{}.xml"/>"#,
                i + 1,
                i + 1
            ));
        }
        out.push_str(&format!(
            r#"<Relationship Id="rId{}" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles" Target="styles.xml"/>"#,
            self.sheets.len() + 1
        ));
        out.push_str("</Relationships>");
        out
    }
}

const PACKAGE_RELS: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
    r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
    r#"<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/>"#,
    r#"</Relationships>"#
);

// Excel wants at least the two default fills.
const STYLES_XML: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
    r#"<styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">"#,
    r#"<fonts count="1"><font><sz val="11"/><name val="Calibri"/></font></fonts>"#,
    r#"<fills count="2"><fill><patternFill patternType="none"/></fill><fill><patternFill patternType="gray125"/></fill></fills>"#,
    r#"<borders count="1"><border/></borders>"#,
    r#"<cellStyleXfs count="1"><xf numFmtId="0" fontId="0" fillId="0" borderId="0"/></cellStyleXfs>"#,
    r#"<cellXfs count="1"><xf numFmtId="0" fontId="0" fillId="0" borderId="0" xfId="0"/></cellXfs>"#,
    r#"</styleSheet>"#
);

fn column_name(mut idx: usize) -> String {
    let mut name = String::new();
    loop {
        name.insert(0, (b'A' + (idx % 26) as u8) as char);
        if idx < 26 {
            break;
        }
        idx = idx / 26 - 1;
    }
    name
}

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
