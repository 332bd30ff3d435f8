//! IPC protocol types and validation for the crash-reporter processes.
//!
//! This crate is shared by the monitoring daemon, the dialog UI, and the
//! auto uploader to prevent schema drift. Receivers remain the authority on
//! validation, but senders reuse the same types to construct valid requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod wire;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_UPLOAD_FILES: usize = 1024;

/// Error code a dialog server returns when the UI it launched died on a signal.
/// The UI was engaged, so callers treat it as success.
pub const ERROR_CHILD_SIGNALED: &str = "child_signaled";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    RequestDialog,
    UploadFiles,
    Quit,
    SetModes,
    ListArtifacts,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: Method, id: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method,
            id: Some(id.into()),
            params,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }

    /// Reads the conventional `{"accepted": bool}` reply used by dialog and
    /// upload requests.
    pub fn accepted(&self) -> bool {
        self.ok
            && self
                .data
                .as_ref()
                .and_then(|data| data.get("accepted"))
                .and_then(|value| value.as_bool())
                .unwrap_or(false)
    }
}

/// Checks the version field before any method-specific handling.
pub fn check_version(request: &Request) -> Result<(), ErrorInfo> {
    if request.protocol_version != PROTOCOL_VERSION {
        return Err(ErrorInfo::new(
            "protocol_mismatch",
            "unsupported protocol version",
        ));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Dialog requests
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DialogKind {
    /// A new crash was found; arguments carry the artifact path.
    Notify,
    /// Offer to send every pending artifact.
    SendAll,
    /// Show upload progress for the given artifact paths.
    Upload,
    MessageBox,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DialogRequest {
    pub dialog: DialogKind,
    #[serde(default)]
    pub arguments: Vec<Value>,
}

impl DialogRequest {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        match self.dialog {
            DialogKind::Notify => {
                let path = self.arguments.first().and_then(|value| value.as_str());
                match path {
                    Some(path) if !path.trim().is_empty() => Ok(()),
                    _ => Err(ErrorInfo::new(
                        "missing_field",
                        "notify dialog requires the artifact path as first argument",
                    )),
                }
            }
            DialogKind::Upload => {
                if self.arguments.is_empty() {
                    return Err(ErrorInfo::new(
                        "missing_field",
                        "upload dialog requires at least one artifact path",
                    ));
                }
                Ok(())
            }
            DialogKind::SendAll | DialogKind::MessageBox => Ok(()),
        }
    }
}

pub fn parse_dialog_request(params: Value) -> Result<DialogRequest, ErrorInfo> {
    let request: DialogRequest = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("dialog payload is invalid: {}", err),
        )
    })?;
    request.validate()?;
    Ok(request)
}

// ─────────────────────────────────────────────────────────────────────────────
// Upload requests
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct UploadFilesParams {
    pub files: Vec<String>,
}

impl UploadFilesParams {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.files.is_empty() {
            return Err(ErrorInfo::new("missing_field", "files must not be empty"));
        }
        if self.files.len() > MAX_UPLOAD_FILES {
            return Err(ErrorInfo::new(
                "too_many_files",
                format!("at most {} files per request", MAX_UPLOAD_FILES),
            ));
        }
        if self.files.iter().any(|file| file.trim().is_empty()) {
            return Err(ErrorInfo::new("invalid_path", "file paths must not be empty"));
        }
        Ok(())
    }
}

pub fn parse_upload_files(params: Value) -> Result<UploadFilesParams, ErrorInfo> {
    let parsed: UploadFilesParams = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("upload payload is invalid: {}", err),
        )
    })?;
    parsed.validate()?;
    Ok(parsed)
}

// ─────────────────────────────────────────────────────────────────────────────
// Mode changes
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
pub struct SetModesParams {
    #[serde(default)]
    pub auto_delete: Option<bool>,
    #[serde(default)]
    pub auto_upload: Option<bool>,
}

pub fn parse_set_modes(params: Value) -> Result<SetModesParams, ErrorInfo> {
    let parsed: SetModesParams = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("set_modes payload is invalid: {}", err),
        )
    })?;
    if parsed.auto_delete.is_none() && parsed.auto_upload.is_none() {
        return Err(ErrorInfo::new(
            "missing_field",
            "auto_delete or auto_upload is required",
        ));
    }
    Ok(parsed)
}
