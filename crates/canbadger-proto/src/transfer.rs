//! SD card file transfer
//!
//! Uploads are pushed by the client in numbered chunks, each released by the
//! probe's ACK to the previous one. Downloads and directory listings are
//! streamed by the probe as `DATA` envelopes.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::debug;

use crate::message::{ActionKind, Message};

/// Largest chunk the probe's receive buffer takes per upload packet
pub const UPLOAD_CHUNK_SIZE: usize = 120;

/// Sub-header the probe prepends to each download `DATA` payload
pub const DOWNLOAD_SUBHEADER_LEN: usize = 6;

pub const ENTRY_TYPE_FILE: u8 = 0x0F;
pub const ENTRY_TYPE_DIRECTORY: u8 = 0xF0;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Malformed listing: {0}")]
    MalformedListing(String),

    #[error("Unknown directory entry type 0x{0:02X}")]
    UnknownEntryType(u8),
}

fn nul_terminated(text: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(text.len() + 1);
    buf.put_slice(text.as_bytes());
    buf.put_u8(0);
    buf.freeze()
}

fn validate_path(path: &str) -> Result<(), TransferError> {
    if path.is_empty() {
        return Err(TransferError::InvalidPath("path is empty".to_string()));
    }
    if !path.is_ascii() || path.contains('\0') {
        return Err(TransferError::InvalidPath(format!(
            "'{path}' must be ASCII without NUL"
        )));
    }
    Ok(())
}

/// Join an SD directory and a file name
pub fn join_path(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    format!("{dir}/{name}")
}

/// Next step of an upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadStep {
    /// Send this message and wait for its ACK
    Send(Message),
    /// The probe closed the file
    Complete,
}

/// Chunked upload of one file to the SD card
#[derive(Debug, Clone)]
pub struct Upload {
    path: String,
    total: usize,
    remaining: Bytes,
    packet_number: u32,
    closing: bool,
}

impl Upload {
    /// Start uploading `data` to `dir/name`. Returns the driver and the
    /// `UPDATE_SD` command opening the file.
    pub fn start(dir: &str, name: &str, data: impl Into<Bytes>) -> Result<(Self, Message), TransferError> {
        let path = join_path(dir, name);
        validate_path(&path)?;
        let open = Message::action(ActionKind::UpdateSd, nul_terminated(&path));
        let data = data.into();
        Ok((
            Self {
                path,
                total: data.len(),
                remaining: data,
                packet_number: 0,
                closing: false,
            },
            open,
        ))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Number of chunks sent so far
    pub fn packets_sent(&self) -> u32 {
        self.packet_number
    }

    /// File bytes handed out in chunks so far
    pub fn bytes_sent(&self) -> usize {
        self.total - self.remaining.len()
    }

    pub fn total_bytes(&self) -> usize {
        self.total
    }

    /// React to an ACK from the probe
    pub fn on_ack(&mut self) -> UploadStep {
        if self.closing {
            return UploadStep::Complete;
        }
        if self.remaining.is_empty() {
            self.closing = true;
            debug!(path = %self.path, packets = self.packet_number, "Upload data exhausted, closing file");
            return UploadStep::Send(Message::command(ActionKind::StopCurrentAction));
        }

        let take = self.remaining.len().min(UPLOAD_CHUNK_SIZE);
        let chunk = self.remaining.split_to(take);
        let mut buf = BytesMut::with_capacity(5 + chunk.len());
        buf.put_u32_le(self.packet_number);
        buf.put_u8(chunk.len() as u8);
        buf.put_slice(&chunk);
        self.packet_number += 1;
        UploadStep::Send(Message::action(ActionKind::UpdateSd, buf.freeze()))
    }
}

/// Accumulating download of one file
#[derive(Debug, Clone)]
pub struct Download {
    path: String,
    buffer: BytesMut,
}

impl Download {
    /// Start a download. Returns the driver and the `DOWNLOAD_FILE` command.
    pub fn start(path: &str) -> Result<(Self, Message), TransferError> {
        validate_path(path)?;
        let request = Message::action(ActionKind::DownloadFile, nul_terminated(path));
        Ok((
            Self {
                path: path.to_string(),
                buffer: BytesMut::new(),
            },
            request,
        ))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Append a `DATA` payload, skipping its sub-header
    pub fn on_data(&mut self, payload: &[u8]) {
        let skip = payload.len().min(DOWNLOAD_SUBHEADER_LEN);
        self.buffer.put_slice(&payload[skip..]);
    }

    pub fn received(&self) -> usize {
        self.buffer.len()
    }

    /// File content, once the probe's ACK ends the transfer
    pub fn finish(self) -> Bytes {
        self.buffer.freeze()
    }
}

/// Kind of a directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

impl EntryKind {
    pub fn type_byte(self) -> u8 {
        match self {
            Self::File => ENTRY_TYPE_FILE,
            Self::Directory => ENTRY_TYPE_DIRECTORY,
        }
    }
}

impl TryFrom<u8> for EntryKind {
    type Error = TransferError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            ENTRY_TYPE_FILE => Ok(Self::File),
            ENTRY_TYPE_DIRECTORY => Ok(Self::Directory),
            other => Err(TransferError::UnknownEntryType(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub parent: String,
    pub name: String,
    pub kind: EntryKind,
}

impl DirEntry {
    pub fn path(&self) -> String {
        join_path(&self.parent, &self.name)
    }
}

/// One `DATA` batch of a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingBatch {
    Entries(Vec<DirEntry>),
    End,
}

fn ascii_field(bytes: &[u8]) -> Result<String, TransferError> {
    if !bytes.is_ascii() {
        return Err(TransferError::MalformedListing(format!(
            "non-ASCII name {}",
            hex::encode(bytes)
        )));
    }
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

/// Parse one listing batch: NUL-terminated parent path followed by
/// `(type, name, NUL)` entries. A leading NUL ends the listing.
pub fn parse_listing_batch(payload: &[u8]) -> Result<ListingBatch, TransferError> {
    let delim = payload
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| TransferError::MalformedListing("parent path is not terminated".to_string()))?;
    if delim == 0 {
        return Ok(ListingBatch::End);
    }

    let parent = ascii_field(&payload[..delim])?;
    let mut rest = &payload[delim + 1..];
    let mut entries = Vec::new();
    while let Some(end) = rest.iter().position(|b| *b == 0) {
        let (&type_byte, name) = rest[..end]
            .split_first()
            .ok_or_else(|| TransferError::MalformedListing("entry without type byte".to_string()))?;
        entries.push(DirEntry {
            parent: parent.clone(),
            name: ascii_field(name)?,
            kind: EntryKind::try_from(type_byte)?,
        });
        rest = &rest[end + 1..];
    }
    Ok(ListingBatch::Entries(entries))
}

/// Encode a listing batch, as the simulator streams it
pub fn encode_listing_batch(parent: &str, entries: &[(EntryKind, &str)]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_slice(parent.as_bytes());
    buf.put_u8(0);
    for (kind, name) in entries {
        buf.put_u8(kind.type_byte());
        buf.put_slice(name.as_bytes());
        buf.put_u8(0);
    }
    buf.freeze()
}

/// Collects directory entries until the terminating batch
#[derive(Debug, Clone, Default)]
pub struct DirectoryListing {
    entries: Vec<DirEntry>,
}

impl DirectoryListing {
    /// Start a listing. Returns the collector and the empty `UPDATE_SD` request.
    pub fn start() -> (Self, Message) {
        (Self::default(), Message::command(ActionKind::UpdateSd))
    }

    /// Feed one `DATA` payload. Returns `true` once the listing has ended.
    pub fn on_data(&mut self, payload: &[u8]) -> Result<bool, TransferError> {
        match parse_listing_batch(payload)? {
            ListingBatch::End => Ok(true),
            ListingBatch::Entries(mut batch) => {
                self.entries.append(&mut batch);
                Ok(false)
            }
        }
    }

    pub fn entries(&self) -> &[DirEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<DirEntry> {
        self.entries
    }
}

/// `DELETE_FILE` command for `path`
pub fn delete_file(path: &str) -> Result<Message, TransferError> {
    validate_path(path)?;
    Ok(Message::action(ActionKind::DeleteFile, nul_terminated(path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Buf;
    use pretty_assertions::assert_eq;

    fn chunk_header(msg: &Message) -> (u32, u8) {
        let mut payload = msg.payload.clone();
        (payload.get_u32_le(), payload.get_u8())
    }

    #[test]
    fn test_upload_250_bytes() {
        let data: Vec<u8> = (0..250u32).map(|i| i as u8).collect();
        let (mut upload, open) = Upload::start("/MITM", "rules.txt", data.clone()).unwrap();
        assert_eq!(open.action, ActionKind::UpdateSd);
        assert_eq!(open.payload.as_ref(), b"/MITM/rules.txt\0");

        let mut received = Vec::new();
        let mut headers = Vec::new();
        loop {
            match upload.on_ack() {
                UploadStep::Send(msg) if msg.action == ActionKind::UpdateSd => {
                    headers.push(chunk_header(&msg));
                    received.extend_from_slice(&msg.payload[5..]);
                }
                UploadStep::Send(msg) => {
                    assert_eq!(msg.action, ActionKind::StopCurrentAction);
                    assert_eq!(upload.on_ack(), UploadStep::Complete);
                    break;
                }
                UploadStep::Complete => panic!("completed before closing"),
            }
        }

        assert_eq!(headers, vec![(0, 120), (1, 120), (2, 10)]);
        assert_eq!(received, data);
        assert_eq!(upload.packets_sent(), 3);
        assert_eq!(upload.bytes_sent(), upload.total_bytes());
    }

    #[test]
    fn test_upload_empty_file_closes_immediately() {
        let (mut upload, _) = Upload::start("/", "empty.txt", Bytes::new()).unwrap();
        assert_eq!(upload.path(), "/empty.txt");
        let UploadStep::Send(msg) = upload.on_ack() else {
            panic!("expected close");
        };
        assert_eq!(msg.action, ActionKind::StopCurrentAction);
        assert_eq!(upload.on_ack(), UploadStep::Complete);
    }

    #[test]
    fn test_upload_rejects_bad_path() {
        assert!(Upload::start("/", "bad\0name", Bytes::new()).is_err());
    }

    #[test]
    fn test_download_strips_subheader() {
        let (mut download, request) = Download::start("/logs/can.txt").unwrap();
        assert_eq!(request.action, ActionKind::DownloadFile);
        assert_eq!(request.payload.as_ref(), b"/logs/can.txt\0");

        download.on_data(b"\x00\x00\x00\x00\x05\x00hello");
        download.on_data(b"\x01\x00\x00\x00\x06\x00 world");
        download.on_data(b"abc");
        assert_eq!(download.finish().as_ref(), b"hello world");
    }

    #[test]
    fn test_listing_batches() {
        let (mut listing, request) = DirectoryListing::start();
        assert_eq!(request.action, ActionKind::UpdateSd);
        assert_eq!(request.payload_length, 0);

        let batch = encode_listing_batch(
            "/",
            &[(EntryKind::Directory, "MITM"), (EntryKind::File, "log.txt")],
        );
        assert!(!listing.on_data(&batch).unwrap());
        let batch = encode_listing_batch("/MITM", &[(EntryKind::File, "rules.txt")]);
        assert!(!listing.on_data(&batch).unwrap());
        assert!(listing.on_data(&[0]).unwrap());

        let entries = listing.into_entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].kind, EntryKind::Directory);
        assert_eq!(entries[0].path(), "/MITM");
        assert_eq!(entries[2].path(), "/MITM/rules.txt");
    }

    #[test]
    fn test_listing_unknown_entry_type() {
        let payload = b"/\0\x42name\0";
        assert_eq!(
            parse_listing_batch(payload),
            Err(TransferError::UnknownEntryType(0x42))
        );
    }

    #[test]
    fn test_listing_requires_terminated_parent() {
        assert!(matches!(
            parse_listing_batch(b"/MITM"),
            Err(TransferError::MalformedListing(_))
        ));
    }

    #[test]
    fn test_delete_file() {
        let msg = delete_file("/MITM/old.txt").unwrap();
        assert_eq!(msg.action, ActionKind::DeleteFile);
        assert_eq!(msg.payload.as_ref(), b"/MITM/old.txt\0");
        assert!(delete_file("").is_err());
    }
}
