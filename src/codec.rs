//! Length-prefixed request and reply frames.
//!
//! Every frame starts with a big-endian `u32` holding the length of the rest of the
//! frame. Integers are big-endian `u32`; strings are a `u32` byte count followed by
//! UTF-8 bytes.
//!
//! Request body: `opcode`, `requester`, the opcode specific payload, then
//! `has_extension` and the optional extension string. Attribute lists are encoded as
//! a count followed by, per entry, the combined string length, name, resource flag
//! and optional resource, value, and the operator tag.
//!
//! Reply body: `code`, `aux`, `choice` and a choice specific payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::ClusterConfig;
use crate::{ClusterError, Result};

/// Size of the frame length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Reply code for success.
pub const REPLY_OK: u32 = 0;
/// The coordinator does not know the job.
pub const REPLY_UNKNOWN_JOB: u32 = 15001;
/// The coordinator does not know the reservation.
pub const REPLY_UNKNOWN_RESERVATION: u32 = 15131;
/// Generic coordinator side failure.
pub const REPLY_SYSTEM: u32 = 15010;

/// Request operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    /// Select jobs matching an attribute list.
    SelectJobs = 16,
    /// Deliver a signal to a job.
    SignalJob = 18,
    /// Close the connection.
    Disconnect = 59,
    /// Modify a reservation.
    ModifyReservation = 91,
    /// Announce membership to a peer coordinator.
    Handshake = 100,
    /// Broadcast a resource usage update.
    ResourceUpdate = 101,
}

impl TryFrom<u32> for Opcode {
    type Error = ClusterError;

    fn try_from(value: u32) -> Result<Self> {
        Ok(match value {
            16 => Opcode::SelectJobs,
            18 => Opcode::SignalJob,
            59 => Opcode::Disconnect,
            91 => Opcode::ModifyReservation,
            100 => Opcode::Handshake,
            101 => Opcode::ResourceUpdate,
            other => return Err(ClusterError::Protocol(format!("unknown opcode {other}"))),
        })
    }
}

/// Attribute operator tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum BatchOp {
    /// Assign the value.
    #[default]
    Set = 0,
    /// Remove the value.
    Unset = 1,
    /// Add to the value.
    Incr = 2,
    /// Subtract from the value.
    Decr = 3,
    /// Equality comparison.
    Eq = 4,
    /// Inequality comparison.
    Ne = 5,
}

impl TryFrom<u32> for BatchOp {
    type Error = ClusterError;

    fn try_from(value: u32) -> Result<Self> {
        Ok(match value {
            0 => BatchOp::Set,
            1 => BatchOp::Unset,
            2 => BatchOp::Incr,
            3 => BatchOp::Decr,
            4 => BatchOp::Eq,
            5 => BatchOp::Ne,
            other => return Err(ClusterError::Protocol(format!("unknown operator {other}"))),
        })
    }
}

/// One name/value attribute entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// Attribute name.
    pub name: String,
    /// Optional resource name qualifying the attribute.
    pub resource: Option<String>,
    /// Attribute value.
    pub value: String,
    /// Operator; always encoded as [`BatchOp::Set`].
    pub op: BatchOp,
}

impl Attribute {
    /// Creates an attribute without a resource.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource: None,
            value: value.into(),
            op: BatchOp::Set,
        }
    }

    /// Creates a resource qualified attribute.
    pub fn with_resource(
        name: impl Into<String>,
        resource: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            resource: Some(resource.into()),
            ..Self::new(name, value)
        }
    }

    fn combined_len(&self) -> usize {
        let mut len = self.name.len() + self.value.len() + 2;
        if let Some(resource) = &self.resource {
            len += resource.len() + 1;
        }
        len
    }
}

/// Operation specific request payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    /// See [`Opcode::Disconnect`].
    Disconnect,
    /// See [`Opcode::Handshake`].
    Handshake,
    /// See [`Opcode::SignalJob`].
    SignalJob {
        /// Target job.
        job_id: String,
        /// Signal name.
        signal: String,
    },
    /// See [`Opcode::ModifyReservation`].
    ModifyReservation {
        /// Target reservation.
        resv_id: String,
        /// Attributes to set.
        attrs: Vec<Attribute>,
    },
    /// See [`Opcode::SelectJobs`].
    SelectJobs {
        /// Selection criteria.
        attrs: Vec<Attribute>,
    },
    /// See [`Opcode::ResourceUpdate`].
    ResourceUpdate {
        /// Job the usage belongs to.
        job_id: String,
        /// Update operation.
        op: u32,
        /// Select specification of the usage.
        select: String,
    },
}

impl RequestBody {
    /// Operation code of this payload.
    pub fn opcode(&self) -> Opcode {
        match self {
            RequestBody::Disconnect => Opcode::Disconnect,
            RequestBody::Handshake => Opcode::Handshake,
            RequestBody::SignalJob { .. } => Opcode::SignalJob,
            RequestBody::ModifyReservation { .. } => Opcode::ModifyReservation,
            RequestBody::SelectJobs { .. } => Opcode::SelectJobs,
            RequestBody::ResourceUpdate { .. } => Opcode::ResourceUpdate,
        }
    }
}

/// A request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Identity of the sender.
    pub requester: String,
    /// Payload.
    pub body: RequestBody,
    /// Optional trailing extension string.
    pub extension: Option<String>,
}

impl Request {
    /// Creates a request without an extension.
    pub fn new(requester: impl Into<String>, body: RequestBody) -> Self {
        Self {
            requester: requester.into(),
            body,
            extension: None,
        }
    }

    /// Sets the extension string.
    pub fn with_extension(mut self, extension: Option<String>) -> Self {
        self.extension = extension;
        self
    }

    /// Operation code of the request.
    pub fn opcode(&self) -> Opcode {
        self.body.opcode()
    }
}

/// Reply payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyBody {
    /// No payload.
    Null,
    /// Free form text.
    Text(String),
    /// Ids produced by a select.
    Select(Vec<String>),
}

impl ReplyBody {
    fn tag(&self) -> u32 {
        match self {
            ReplyBody::Null => 1,
            ReplyBody::Text(_) => 2,
            ReplyBody::Select(_) => 3,
        }
    }
}

/// A reply frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// [`REPLY_OK`] or an error code.
    pub code: u32,
    /// Auxiliary code.
    pub aux: u32,
    /// Payload.
    pub body: ReplyBody,
}

impl Reply {
    /// Successful reply without payload.
    pub fn ok() -> Self {
        Self::with_body(ReplyBody::Null)
    }

    /// Successful reply with `body`.
    pub fn with_body(body: ReplyBody) -> Self {
        Self {
            code: REPLY_OK,
            aux: 0,
            body,
        }
    }

    /// Error reply.
    pub fn error(code: u32, text: impl Into<String>) -> Self {
        Self {
            code,
            aux: 0,
            body: ReplyBody::Text(text.into()),
        }
    }

    /// Converts an error code into the matching [`ClusterError`].
    ///
    /// Unknown job and unknown reservation become
    /// [`ClusterError::TargetNotRecognized`] for `target`.
    pub fn into_result(self, target: &str) -> Result<Reply> {
        match self.code {
            REPLY_OK => Ok(self),
            REPLY_UNKNOWN_JOB | REPLY_UNKNOWN_RESERVATION => {
                Err(ClusterError::TargetNotRecognized(target.to_string()))
            }
            code => Err(ClusterError::Rejected {
                code,
                text: match self.body {
                    ReplyBody::Text(text) => text,
                    _ => String::new(),
                },
            }),
        }
    }
}

/// Encoder and decoder for request and reply frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_len: usize,
    max_string_len: usize,
    max_attr_count: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(&ClusterConfig::default())
    }
}

impl FrameCodec {
    /// Creates a codec enforcing the bounds in `config`.
    pub fn new(config: &ClusterConfig) -> Self {
        Self {
            max_frame_len: config.max_frame_len,
            max_string_len: config.max_string_len,
            max_attr_count: config.max_attr_count,
        }
    }

    /// Encodes a complete request frame, length prefix included.
    pub fn encode_request(&self, request: &Request) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_u32(0);
        buf.put_u32(request.opcode() as u32);
        self.put_str(&mut buf, &request.requester)?;

        match &request.body {
            RequestBody::Disconnect | RequestBody::Handshake => {}
            RequestBody::SignalJob { job_id, signal } => {
                self.put_str(&mut buf, job_id)?;
                self.put_str(&mut buf, signal)?;
            }
            RequestBody::ModifyReservation { resv_id, attrs } => {
                self.put_str(&mut buf, resv_id)?;
                self.put_attrs(&mut buf, attrs)?;
            }
            RequestBody::SelectJobs { attrs } => self.put_attrs(&mut buf, attrs)?,
            RequestBody::ResourceUpdate { job_id, op, select } => {
                self.put_str(&mut buf, job_id)?;
                buf.put_u32(*op);
                self.put_str(&mut buf, select)?;
            }
        }

        match &request.extension {
            Some(extension) => {
                buf.put_u32(1);
                self.put_str(&mut buf, extension)?;
            }
            None => buf.put_u32(0),
        }
        self.finish(buf)
    }

    /// Decodes a complete request frame, length prefix included.
    pub fn decode_request(&self, frame: &[u8]) -> Result<Request> {
        let mut buf = self.body(frame)?;
        let opcode = Opcode::try_from(get_u32(&mut buf)?)?;
        let requester = self.get_str(&mut buf)?;

        let body = match opcode {
            Opcode::Disconnect => RequestBody::Disconnect,
            Opcode::Handshake => RequestBody::Handshake,
            Opcode::SignalJob => RequestBody::SignalJob {
                job_id: self.get_str(&mut buf)?,
                signal: self.get_str(&mut buf)?,
            },
            Opcode::ModifyReservation => RequestBody::ModifyReservation {
                resv_id: self.get_str(&mut buf)?,
                attrs: self.get_attrs(&mut buf)?,
            },
            Opcode::SelectJobs => RequestBody::SelectJobs {
                attrs: self.get_attrs(&mut buf)?,
            },
            Opcode::ResourceUpdate => RequestBody::ResourceUpdate {
                job_id: self.get_str(&mut buf)?,
                op: get_u32(&mut buf)?,
                select: self.get_str(&mut buf)?,
            },
        };

        let extension = match get_u32(&mut buf)? {
            0 => None,
            1 => Some(self.get_str(&mut buf)?),
            other => {
                return Err(ClusterError::Protocol(format!(
                    "invalid extension flag {other}"
                )))
            }
        };
        expect_end(buf)?;

        Ok(Request {
            requester,
            body,
            extension,
        })
    }

    /// Encodes a complete reply frame.
    pub fn encode_reply(&self, reply: &Reply) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u32(0);
        buf.put_u32(reply.code);
        buf.put_u32(reply.aux);
        buf.put_u32(reply.body.tag());
        match &reply.body {
            ReplyBody::Null => {}
            ReplyBody::Text(text) => self.put_str(&mut buf, text)?,
            ReplyBody::Select(ids) => {
                self.check_count(ids.len(), "selected ids")?;
                buf.put_u32(ids.len() as u32);
                for id in ids {
                    self.put_str(&mut buf, id)?;
                }
            }
        }
        self.finish(buf)
    }

    /// Decodes a complete reply frame.
    pub fn decode_reply(&self, frame: &[u8]) -> Result<Reply> {
        let mut buf = self.body(frame)?;
        let code = get_u32(&mut buf)?;
        let aux = get_u32(&mut buf)?;
        let body = match get_u32(&mut buf)? {
            1 => ReplyBody::Null,
            2 => ReplyBody::Text(self.get_str(&mut buf)?),
            3 => {
                let count = self.get_count(&mut buf)?;
                let mut ids = Vec::with_capacity(count);
                for _ in 0..count {
                    ids.push(self.get_str(&mut buf)?);
                }
                ReplyBody::Select(ids)
            }
            other => {
                return Err(ClusterError::Protocol(format!(
                    "unknown reply choice {other}"
                )))
            }
        };
        expect_end(buf)?;
        Ok(Reply { code, aux, body })
    }

    /// Reads one frame, length prefix included.
    ///
    /// End of stream before the first byte is reported as an I/O error; end of
    /// stream inside a frame is a protocol error.
    pub async fn read_frame<R>(&self, reader: &mut R) -> Result<BytesMut>
    where
        R: AsyncRead + Unpin,
    {
        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        reader.read_exact(&mut prefix).await?;
        let len = u32::from_be_bytes(prefix) as usize;
        if len == 0 || len > self.max_frame_len {
            return Err(ClusterError::Protocol(format!("invalid frame length {len}")));
        }

        let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_LEN + len);
        frame.put_slice(&prefix);
        frame.resize(LENGTH_PREFIX_LEN + len, 0);
        reader
            .read_exact(&mut frame[LENGTH_PREFIX_LEN..])
            .await
            .map_err(|err| ClusterError::Protocol(format!("short frame: {err}")))?;
        Ok(frame)
    }

    /// Reads and decodes a reply.
    pub async fn read_reply<R>(&self, reader: &mut R) -> Result<Reply>
    where
        R: AsyncRead + Unpin,
    {
        let frame = self.read_frame(reader).await?;
        self.decode_reply(&frame)
    }

    /// Reads and decodes a request.
    pub async fn read_request<R>(&self, reader: &mut R) -> Result<Request>
    where
        R: AsyncRead + Unpin,
    {
        let frame = self.read_frame(reader).await?;
        self.decode_request(&frame)
    }

    /// Encodes and writes a request.
    pub async fn write_request<W>(&self, writer: &mut W, request: &Request) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let frame = self.encode_request(request)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Encodes and writes a reply.
    pub async fn write_reply<W>(&self, writer: &mut W, reply: &Reply) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let frame = self.encode_reply(reply)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    fn finish(&self, mut buf: BytesMut) -> Result<Bytes> {
        let len = buf.len() - LENGTH_PREFIX_LEN;
        if len > self.max_frame_len {
            return Err(ClusterError::Protocol(format!(
                "frame of {len} bytes exceeds limit of {}",
                self.max_frame_len
            )));
        }
        buf[..LENGTH_PREFIX_LEN].copy_from_slice(&(len as u32).to_be_bytes());
        Ok(buf.freeze())
    }

    fn body<'a>(&self, frame: &'a [u8]) -> Result<&'a [u8]> {
        if frame.len() < LENGTH_PREFIX_LEN {
            return Err(ClusterError::Protocol("frame shorter than its prefix".into()));
        }
        let (prefix, body) = frame.split_at(LENGTH_PREFIX_LEN);
        let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if len != body.len() {
            return Err(ClusterError::Protocol(format!(
                "frame length {len} does not match {} body bytes",
                body.len()
            )));
        }
        if len > self.max_frame_len {
            return Err(ClusterError::Protocol(format!("invalid frame length {len}")));
        }
        Ok(body)
    }

    fn put_str(&self, buf: &mut BytesMut, value: &str) -> Result<()> {
        if value.len() > self.max_string_len {
            return Err(ClusterError::Protocol(format!(
                "string of {} bytes exceeds limit of {}",
                value.len(),
                self.max_string_len
            )));
        }
        buf.put_u32(value.len() as u32);
        buf.put_slice(value.as_bytes());
        Ok(())
    }

    fn get_str(&self, buf: &mut &[u8]) -> Result<String> {
        let len = get_u32(buf)? as usize;
        if len > self.max_string_len {
            return Err(ClusterError::Protocol(format!(
                "string of {len} bytes exceeds limit of {}",
                self.max_string_len
            )));
        }
        if buf.remaining() < len {
            return Err(ClusterError::Protocol("short string".into()));
        }
        let slice: &[u8] = *buf;
        let (bytes, rest) = slice.split_at(len);
        let value = std::str::from_utf8(bytes)
            .map_err(|err| ClusterError::Protocol(format!("invalid utf-8: {err}")))?
            .to_string();
        *buf = rest;
        Ok(value)
    }

    fn get_count(&self, buf: &mut &[u8]) -> Result<usize> {
        let count = get_u32(buf)? as usize;
        // each entry needs at least one u32
        if count > self.max_attr_count || count > buf.remaining() / 4 {
            return Err(ClusterError::Protocol(format!("bad entry count {count}")));
        }
        Ok(count)
    }

    // entry lists the decoder would reject are refused before encoding
    fn check_count(&self, count: usize, what: &str) -> Result<()> {
        if count > self.max_attr_count {
            return Err(ClusterError::InvalidRequest(format!(
                "{count} {what} exceed limit of {}",
                self.max_attr_count
            )));
        }
        Ok(())
    }

    fn put_attrs(&self, buf: &mut BytesMut, attrs: &[Attribute]) -> Result<()> {
        self.check_count(attrs.len(), "attributes")?;
        buf.put_u32(attrs.len() as u32);
        for attr in attrs {
            buf.put_u32(attr.combined_len() as u32);
            self.put_str(buf, &attr.name)?;
            match &attr.resource {
                Some(resource) => {
                    buf.put_u32(1);
                    self.put_str(buf, resource)?;
                }
                None => buf.put_u32(0),
            }
            self.put_str(buf, &attr.value)?;
            buf.put_u32(BatchOp::Set as u32);
        }
        Ok(())
    }

    fn get_attrs(&self, buf: &mut &[u8]) -> Result<Vec<Attribute>> {
        let count = self.get_count(buf)?;
        let mut attrs = Vec::with_capacity(count);
        for _ in 0..count {
            let combined = get_u32(buf)? as usize;
            let name = self.get_str(buf)?;
            let resource = match get_u32(buf)? {
                0 => None,
                1 => Some(self.get_str(buf)?),
                other => {
                    return Err(ClusterError::Protocol(format!(
                        "invalid resource flag {other}"
                    )))
                }
            };
            let value = self.get_str(buf)?;
            let op = BatchOp::try_from(get_u32(buf)?)?;
            let attr = Attribute {
                name,
                resource,
                value,
                op,
            };
            if attr.combined_len() != combined {
                return Err(ClusterError::Protocol(format!(
                    "attribute `{}` length {combined} does not match its strings",
                    attr.name
                )));
            }
            attrs.push(attr);
        }
        Ok(attrs)
    }
}

fn get_u32(buf: &mut &[u8]) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(ClusterError::Protocol("short read".into()));
    }
    Ok(buf.get_u32())
}

fn expect_end(buf: &[u8]) -> Result<()> {
    if buf.is_empty() {
        Ok(())
    } else {
        Err(ClusterError::Protocol(format!(
            "{} trailing bytes after frame",
            buf.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> FrameCodec {
        FrameCodec::default()
    }

    fn select(attrs: Vec<Attribute>) -> Request {
        Request::new("client@host", RequestBody::SelectJobs { attrs })
    }

    #[test]
    fn empty_attribute_list() {
        let frame = codec().encode_request(&select(Vec::new())).unwrap();
        let decoded = codec().decode_request(&frame).unwrap();
        assert_eq!(decoded.body, RequestBody::SelectJobs { attrs: Vec::new() });
    }

    #[test]
    fn attributes_with_and_without_resource() {
        let attrs = vec![
            Attribute::new("job_state", "R"),
            Attribute::with_resource("Resource_List", "ncpus", "4"),
            Attribute::new("queue", "workq"),
        ];
        let request = select(attrs.clone()).with_extension(Some("ext=1".into()));

        let frame = codec().encode_request(&request).unwrap();
        let decoded = codec().decode_request(&frame).unwrap();

        assert_eq!(decoded, request);
        let RequestBody::SelectJobs { attrs: got } = decoded.body else {
            panic!("wrong body");
        };
        assert_eq!(got[1].resource.as_deref(), Some("ncpus"));
        assert!(got.iter().all(|attr| attr.op == BatchOp::Set));
    }

    #[test]
    fn encoder_forces_set_operator() {
        let mut attr = Attribute::new("Resource_List.walltime", "01:00:00");
        attr.op = BatchOp::Incr;
        let request = Request::new(
            "client",
            RequestBody::ModifyReservation {
                resv_id: "R12.svr".into(),
                attrs: vec![attr],
            },
        );

        let frame = codec().encode_request(&request).unwrap();
        let decoded = codec().decode_request(&frame).unwrap();
        let RequestBody::ModifyReservation { attrs, .. } = decoded.body else {
            panic!("wrong body");
        };
        assert_eq!(attrs[0].op, BatchOp::Set);
    }

    #[test]
    fn combined_length_counts_all_strings() {
        let frame = codec()
            .encode_request(&select(vec![Attribute::with_resource("ab", "c", "def")]))
            .unwrap();
        // prefix, opcode, requester (4 + 11), count
        let offset = 4 + 4 + 4 + "client@host".len() + 4;
        let combined = u32::from_be_bytes(frame[offset..offset + 4].try_into().unwrap());
        assert_eq!(combined, 2 + 3 + 2 + 1 + 1);
    }

    #[test]
    fn truncated_frames_are_protocol_errors() {
        let frame = codec()
            .encode_request(&select(vec![Attribute::new("a", "b")]))
            .unwrap();
        for cut in 0..frame.len() {
            let err = codec().decode_request(&frame[..cut]).unwrap_err();
            assert!(matches!(err, ClusterError::Protocol(_)), "cut at {cut}");
        }
    }

    #[test]
    fn count_larger_than_payload_is_rejected() {
        let mut frame = BytesMut::new();
        frame.put_u32(0);
        frame.put_u32(Opcode::SelectJobs as u32);
        frame.put_u32(0);
        frame.put_u32(1_000);
        frame.put_u32(0);
        let len = (frame.len() - 4) as u32;
        frame[..4].copy_from_slice(&len.to_be_bytes());

        let err = codec().decode_request(&frame).unwrap_err();
        assert!(matches!(err, ClusterError::Protocol(msg) if msg.contains("count")));
    }

    #[test]
    fn oversized_strings_are_rejected() {
        let small = FrameCodec::new(&ClusterConfig {
            max_string_len: 8,
            ..Default::default()
        });
        let request = Request::new(
            "client",
            RequestBody::SignalJob {
                job_id: "1234567890.svr".into(),
                signal: "SIGTERM".into(),
            },
        );
        assert!(matches!(
            small.encode_request(&request),
            Err(ClusterError::Protocol(_))
        ));

        let frame = codec().encode_request(&request).unwrap();
        assert!(matches!(
            small.decode_request(&frame),
            Err(ClusterError::Protocol(_))
        ));
    }

    #[test]
    fn oversized_entry_lists_are_not_encoded() {
        let small = FrameCodec::new(&ClusterConfig {
            max_attr_count: 2,
            ..Default::default()
        });
        let ids = vec!["1.a".to_string(), "2.a".to_string(), "3.a".to_string()];
        let reply = Reply::with_body(ReplyBody::Select(ids.clone()));
        assert!(matches!(
            small.encode_reply(&reply),
            Err(ClusterError::InvalidRequest(_))
        ));
        // what the default codec writes, the small one refuses to read
        let frame = codec().encode_reply(&reply).unwrap();
        assert!(matches!(
            small.decode_reply(&frame),
            Err(ClusterError::Protocol(_))
        ));

        let attrs = ids.iter().map(|id| Attribute::new("job", id.as_str())).collect();
        let select = Request::new("client", RequestBody::SelectJobs { attrs });
        assert!(matches!(
            small.encode_request(&select),
            Err(ClusterError::InvalidRequest(_))
        ));
    }

    #[test]
    fn every_request_kind_decodes() {
        let bodies = vec![
            RequestBody::Disconnect,
            RequestBody::Handshake,
            RequestBody::SignalJob {
                job_id: "1.svr".into(),
                signal: "suspend".into(),
            },
            RequestBody::ResourceUpdate {
                job_id: "2.svr".into(),
                op: 1,
                select: "1:ncpus=2".into(),
            },
        ];
        for body in bodies {
            let request = Request::new("svr1", body);
            let frame = codec().encode_request(&request).unwrap();
            assert_eq!(codec().decode_request(&frame).unwrap(), request);
        }
    }

    #[test]
    fn reply_codes_map_to_errors() {
        assert!(Reply::ok().into_result("1.svr").is_ok());
        assert!(matches!(
            Reply::error(REPLY_UNKNOWN_JOB, "").into_result("1.svr"),
            Err(ClusterError::TargetNotRecognized(target)) if target == "1.svr"
        ));
        assert!(matches!(
            Reply::error(REPLY_SYSTEM, "boom").into_result("1.svr"),
            Err(ClusterError::Rejected { code: REPLY_SYSTEM, text }) if text == "boom"
        ));
    }

    #[test]
    fn select_reply_decodes() {
        let reply = Reply::with_body(ReplyBody::Select(vec!["1.svr".into(), "2.svr".into()]));
        let frame = codec().encode_reply(&reply).unwrap();
        assert_eq!(codec().decode_reply(&frame).unwrap(), reply);
    }

    #[tokio::test]
    async fn reads_frames_from_a_stream() {
        let request = select(vec![Attribute::new("queue", "workq")]);
        let frame = codec().encode_request(&request).unwrap();
        let mut reader = tokio_test::io::Builder::new()
            .read(&frame[..6])
            .read(&frame[6..])
            .build();

        let decoded = codec().read_request(&mut reader).await.unwrap();
        assert_eq!(decoded, request);
    }

    #[tokio::test]
    async fn eof_inside_frame_is_protocol_error() {
        let frame = codec().encode_reply(&Reply::ok()).unwrap();
        let mut reader = tokio_test::io::Builder::new().read(&frame[..7]).build();

        let err = codec().read_reply(&mut reader).await.unwrap_err();
        assert!(matches!(err, ClusterError::Protocol(_)));
    }
}
