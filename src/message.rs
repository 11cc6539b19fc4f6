//! Outgoing message model and MIME assembly.

use crate::error::{DeliveryError, Result};
use lettre::message::header::{ContentDisposition, ContentTransferEncoding, ContentType};
use lettre::message::{Body, Mailbox, MultiPart, SinglePart};
use lettre::Message;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Arc;

const OCTET_STREAM: &str = "application/octet-stream";

/// A named, immutable file payload shared by every message of a campaign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    filename: String,
    content: Arc<[u8]>,
}

impl Attachment {
    pub fn new(filename: impl Into<String>, content: impl Into<Arc<[u8]>>) -> Self {
        Self {
            filename: filename.into(),
            content: content.into(),
        }
    }

    /// Read a file from disk, keeping only its final path component as the name.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read(path).await?;
        let filename = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
        Ok(Self::new(filename, content))
    }

    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// The full payload.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.content
    }

    /// A fresh reader positioned at the start of the payload.
    #[must_use]
    pub fn reader(&self) -> Cursor<&[u8]> {
        Cursor::new(self.bytes())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.content.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// A fully personalized message ready for a relay session.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub attachments: Arc<[Attachment]>,
}

impl OutgoingMessage {
    /// Assemble the MIME message: a `multipart/mixed` with the plain-text body
    /// followed by one base64 part per attachment.
    pub fn to_mime(&self) -> std::result::Result<Message, DeliveryError> {
        let from: Mailbox = self
            .from
            .parse()
            .map_err(|_| DeliveryError::InvalidAddress(self.from.clone()))?;
        let to: Mailbox = self
            .to
            .parse()
            .map_err(|_| DeliveryError::InvalidAddress(self.to.clone()))?;

        let mut mixed = MultiPart::mixed().singlepart(SinglePart::plain(self.body.clone()));
        for attachment in self.attachments.iter() {
            mixed = mixed.singlepart(attachment_part(attachment)?);
        }

        Message::builder()
            .from(from)
            .to(to)
            .subject(self.subject.clone())
            .multipart(mixed)
            .map_err(|e| DeliveryError::Build(e.to_string()))
    }
}

fn attachment_part(attachment: &Attachment) -> std::result::Result<SinglePart, DeliveryError> {
    let content_type =
        ContentType::parse(OCTET_STREAM).map_err(|e| DeliveryError::Build(e.to_string()))?;
    let mut content = Vec::with_capacity(attachment.len());
    attachment
        .reader()
        .read_to_end(&mut content)
        .map_err(|e| DeliveryError::Build(format!("cannot read {}: {e}", attachment.filename())))?;
    let body = Body::new_with_encoding(content, ContentTransferEncoding::Base64)
        .map_err(|_| DeliveryError::Build(format!("cannot encode {}", attachment.filename())))?;

    Ok(SinglePart::builder()
        .header(content_type)
        .header(ContentDisposition::attachment(attachment.filename()))
        .body(body))
}
