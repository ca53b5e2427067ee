//! 上传文件解析：发件人背景文本与联系人列表
//!
//! 背景文本支持 .txt / .md / .html；联系人列表为 CSV 导出，允许表头前有说明行，
//! 表头按别名解析（每个文件只解析一次）。

use std::path::Path;

use thiserror::Error;

use crate::store::Contact;

/// 上传的文件
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    pub fn new(file_name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes: bytes.into(),
        }
    }

    fn extension(&self) -> String {
        Path::new(&self.file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default()
    }
}

/// 解析错误
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("File type '{0}' not supported. Please use TXT, MD or HTML files.")]
    UnsupportedFormat(String),

    #[error("File {0} is not valid UTF-8 text")]
    Encoding(String),

    #[error("Invalid data at row {row}: Missing required fields ({})", missing.join(", "))]
    MalformedRecord {
        /// 从 1 开始的数据行号（不含表头与空行）
        row: usize,
        missing: Vec<&'static str>,
    },

    #[error("No header row found: expected First Name and Last Name columns")]
    MissingHeader,

    #[error("Failed to parse contact list: {0}")]
    Csv(#[from] csv::Error),
}

/// 提取背景文本
pub fn extract_background_text(file: &UploadedFile) -> Result<String, IngestError> {
    let ext = file.extension();
    match ext.as_str() {
        "txt" | "md" => decode_utf8(file),
        "html" | "htm" => {
            let html = decode_utf8(file)?;
            Ok(html2text::from_read(html.as_bytes(), 120)
                .unwrap_or(html)
                .trim()
                .to_string())
        }
        _ => Err(IngestError::UnsupportedFormat(if ext.is_empty() {
            file.file_name.clone()
        } else {
            format!(".{}", ext)
        })),
    }
}

fn decode_utf8(file: &UploadedFile) -> Result<String, IngestError> {
    let text = std::str::from_utf8(&file.bytes)
        .map_err(|_| IngestError::Encoding(file.file_name.clone()))?;
    Ok(text.trim_start_matches('\u{feff}').trim().to_string())
}

/// 联系人字段及其可接受的表头（按优先级）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    FirstName,
    LastName,
    ProfileUrl,
    Email,
    Company,
    Position,
    ConnectedOn,
}

impl Field {
    const ALL: [Field; 7] = [
        Field::FirstName,
        Field::LastName,
        Field::ProfileUrl,
        Field::Email,
        Field::Company,
        Field::Position,
        Field::ConnectedOn,
    ];

    fn aliases(self) -> &'static [&'static str] {
        match self {
            Field::FirstName => &["First Name", "firstName"],
            Field::LastName => &["Last Name", "lastName"],
            Field::ProfileUrl => &["URL", "Profile URL", "profileUrl"],
            Field::Email => &["Email Address", "email"],
            Field::Company => &["Company", "company"],
            Field::Position => &["Position", "position"],
            Field::ConnectedOn => &["Connected On", "connectedOn"],
        }
    }

    fn label(self) -> &'static str {
        match self {
            Field::FirstName => "First Name",
            Field::LastName => "Last Name",
            Field::ProfileUrl => "URL",
            Field::Email => "Email Address",
            Field::Company => "Company",
            Field::Position => "Position",
            Field::ConnectedOn => "Connected On",
        }
    }
}

/// 已解析的表头：字段 → 列号
#[derive(Debug, Default)]
struct ColumnMap {
    columns: [Option<usize>; 7],
}

impl ColumnMap {
    /// 同时有名和姓两列时视为表头
    fn resolve(row: &csv::StringRecord) -> Option<Self> {
        let cells: Vec<&str> = row.iter().map(str::trim).collect();
        let mut map = ColumnMap::default();
        for (slot, field) in Field::ALL.iter().enumerate() {
            map.columns[slot] = field
                .aliases()
                .iter()
                .find_map(|alias| cells.iter().position(|c| c == alias));
        }
        (map.get(Field::FirstName).is_some() && map.get(Field::LastName).is_some()).then_some(map)
    }

    fn get(&self, field: Field) -> Option<usize> {
        Field::ALL
            .iter()
            .position(|f| *f == field)
            .and_then(|slot| self.columns[slot])
    }

    fn value<'r>(&self, row: &'r csv::StringRecord, field: Field) -> Option<&'r str> {
        self.get(field)
            .and_then(|i| row.get(i))
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

/// 解析联系人列表
///
/// 任一行缺少名、姓或资料页地址即整体失败，不返回部分结果。
pub fn parse_contact_list(file: &UploadedFile) -> Result<Vec<Contact>, IngestError> {
    let text = decode_utf8(file)?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut columns: Option<ColumnMap> = None;
    let mut saw_content = false;
    let mut contacts = Vec::new();
    let mut row = 0usize;

    for record in reader.records() {
        let record = record?;
        if record.iter().all(|c| c.trim().is_empty()) {
            continue;
        }
        saw_content = true;

        if columns.is_none() {
            // 表头之前的导出说明行直接跳过
            columns = ColumnMap::resolve(&record);
            continue;
        }
        let Some(map) = &columns else { continue };

        row += 1;
        let first_name = map.value(&record, Field::FirstName);
        let last_name = map.value(&record, Field::LastName);
        let profile_url = map.value(&record, Field::ProfileUrl);

        let missing: Vec<&'static str> = [
            (Field::FirstName, first_name),
            (Field::LastName, last_name),
            (Field::ProfileUrl, profile_url),
        ]
        .iter()
        .filter(|(_, v)| v.is_none())
        .map(|(f, _)| f.label())
        .collect();

        let (Some(first_name), Some(last_name), Some(profile_url)) =
            (first_name, last_name, profile_url)
        else {
            return Err(IngestError::MalformedRecord { row, missing });
        };

        let optional = |field| map.value(&record, field).map(String::from);
        contacts.push(Contact {
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            profile_url: profile_url.to_string(),
            email: optional(Field::Email),
            company: optional(Field::Company),
            position: optional(Field::Position),
            connected_on: optional(Field::ConnectedOn),
        });
    }

    if columns.is_none() && saw_content {
        return Err(IngestError::MissingHeader);
    }
    Ok(contacts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csv(body: &str) -> UploadedFile {
        UploadedFile::new("connections.csv", body.as_bytes().to_vec())
    }

    #[test]
    fn test_background_formats() {
        let txt = UploadedFile::new("resume.TXT", "\u{feff}  Rust engineer, 10 years  \n");
        assert_eq!(extract_background_text(&txt).unwrap(), "Rust engineer, 10 years");

        let html = UploadedFile::new("cv.html", "<html><body><h1>Ada</h1><p>Analyst</p></body></html>");
        let text = extract_background_text(&html).unwrap();
        assert!(text.contains("Ada"));
        assert!(text.contains("Analyst"));
        assert!(!text.contains("<p>"));
    }

    #[test]
    fn test_background_rejects_unknown_format() {
        let pdf = UploadedFile::new("resume.pdf", vec![0x25, 0x50]);
        assert!(matches!(
            extract_background_text(&pdf),
            Err(IngestError::UnsupportedFormat(ext)) if ext == ".pdf"
        ));
        let bad = UploadedFile::new("resume.txt", vec![0xff, 0xfe, 0x00]);
        assert!(matches!(extract_background_text(&bad), Err(IngestError::Encoding(_))));
    }

    #[test]
    fn test_export_with_preamble() {
        let file = csv(
            "Notes:\n\
             \"When exporting your connection data, you may notice that some of the email addresses are missing.\"\n\
             \n\
             First Name,Last Name,URL,Email Address,Company,Position,Connected On\n\
             Ada,Lovelace,https://example.com/in/ada,,Analytical Engines,Programmer,01 Jan 2024\n\
             \n\
             Alan,Turing,https://example.com/in/alan,alan@example.com,,,\n",
        );
        let contacts = parse_contact_list(&file).unwrap();
        assert_eq!(contacts.len(), 2);
        assert_eq!(contacts[0].first_name, "Ada");
        assert_eq!(contacts[0].company.as_deref(), Some("Analytical Engines"));
        assert_eq!(contacts[0].position.as_deref(), Some("Programmer"));
        assert_eq!(contacts[0].email, None);
        assert_eq!(contacts[1].email.as_deref(), Some("alan@example.com"));
        assert_eq!(contacts[1].company, None);
    }

    #[test]
    fn test_camel_case_aliases() {
        let file = csv("firstName,lastName,profileUrl,company\nGrace,Hopper,https://example.com/in/grace,Navy\n");
        let contacts = parse_contact_list(&file).unwrap();
        assert_eq!(contacts[0].full_name(), "Grace Hopper");
        assert_eq!(contacts[0].profile_url, "https://example.com/in/grace");
    }

    #[test]
    fn test_missing_locator_cites_row() {
        let file = csv(
            "First Name,Last Name,URL\n\
             Ada,Lovelace,https://example.com/in/ada\n\
             Alan,Turing,\n",
        );
        let err = parse_contact_list(&file).unwrap_err();
        match &err {
            IngestError::MalformedRecord { row, missing } => {
                assert_eq!(*row, 2);
                assert_eq!(missing, &vec!["URL"]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(
            err.to_string(),
            "Invalid data at row 2: Missing required fields (URL)"
        );
    }

    #[test]
    fn test_no_header() {
        let file = csv("just,some,values\n1,2,3\n");
        assert!(matches!(parse_contact_list(&file), Err(IngestError::MissingHeader)));
        assert!(parse_contact_list(&csv("\n\n")).unwrap().is_empty());
    }
}
