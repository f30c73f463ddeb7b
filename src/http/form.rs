//! Multipart uploads
//!
//! Files are held in memory and the form is rebuilt for every attempt, so a
//! retried request always sends the whole payload from the start.

use crate::error::HttpError;
use reqwest::multipart::{Form, Part};
use serde_json::{json, Value};
use std::path::Path;

/// An attachment to upload
#[derive(Debug, Clone)]
pub struct File {
    pub filename: String,
    pub description: Option<String>,
    pub data: Vec<u8>,
}

impl File {
    pub fn new(filename: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            description: None,
            data: data.into(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Read a file from disk; the name is the path's last component
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        Ok(Self::new(filename, data))
    }
}

/// Attachment metadata merged into `payload_json`
fn attachments(files: &[File]) -> Value {
    Value::Array(
        files
            .iter()
            .enumerate()
            .map(|(index, file)| {
                let mut entry = json!({ "id": index, "filename": file.filename });
                if let Some(description) = &file.description {
                    entry["description"] = json!(description);
                }
                entry
            })
            .collect(),
    )
}

/// Build the multipart body: a `payload_json` part followed by `files[n]`
pub fn prepare_form(files: &[File], payload: Option<&Value>) -> Result<Form, HttpError> {
    let mut payload = match payload {
        Some(Value::Object(map)) => Value::Object(map.clone()),
        Some(other) => json!({ "content": other }),
        None => json!({}),
    };
    payload["attachments"] = attachments(files);

    let json_part = Part::text(serde_json::to_string(&payload)?).mime_str("application/json")?;
    let mut form = Form::new().part("payload_json", json_part);

    for (index, file) in files.iter().enumerate() {
        let part = Part::bytes(file.data.clone())
            .file_name(file.filename.clone())
            .mime_str("application/octet-stream")?;
        form = form.part(format!("files[{index}]"), part);
    }

    Ok(form)
}
