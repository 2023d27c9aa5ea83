//! LDAP v3 message model and BER codec (RFC 4511).
//!
//! Encoding always emits definite lengths; decoding additionally accepts
//! indefinite-length encodings for constructed values.

use crate::error::{LdapError, Result};
use crate::filter::Filter;

/// RFC 2696 paged results control OID.
pub const PAGED_RESULTS_OID: &str = "1.2.840.113556.1.4.319";

// Universal tags
pub(crate) const TAG_BOOLEAN: u8 = 0x01;
pub(crate) const TAG_INTEGER: u8 = 0x02;
pub(crate) const TAG_OCTET_STRING: u8 = 0x04;
pub(crate) const TAG_ENUMERATED: u8 = 0x0A;
pub(crate) const TAG_SEQUENCE: u8 = 0x30;
pub(crate) const TAG_SET: u8 = 0x31;

// Application tags for protocolOp (RFC 4511 §4.1.1)
pub const TAG_BIND_REQUEST: u8 = 0x60;
pub const TAG_BIND_RESPONSE: u8 = 0x61;
pub const TAG_UNBIND_REQUEST: u8 = 0x42;
pub const TAG_SEARCH_REQUEST: u8 = 0x63;
pub const TAG_SEARCH_RESULT_ENTRY: u8 = 0x64;
pub const TAG_SEARCH_RESULT_DONE: u8 = 0x65;
pub const TAG_SEARCH_RESULT_REFERENCE: u8 = 0x73;
pub const TAG_MODIFY_REQUEST: u8 = 0x66;
pub const TAG_MODIFY_RESPONSE: u8 = 0x67;
pub const TAG_ADD_REQUEST: u8 = 0x68;
pub const TAG_ADD_RESPONSE: u8 = 0x69;
pub const TAG_DEL_REQUEST: u8 = 0x4A;
pub const TAG_DEL_RESPONSE: u8 = 0x6B;
pub const TAG_MODIFY_DN_REQUEST: u8 = 0x6C;
pub const TAG_MODIFY_DN_RESPONSE: u8 = 0x6D;
pub const TAG_COMPARE_REQUEST: u8 = 0x6E;
pub const TAG_COMPARE_RESPONSE: u8 = 0x6F;
pub const TAG_ABANDON_REQUEST: u8 = 0x50;
pub const TAG_EXTENDED_REQUEST: u8 = 0x77;
pub const TAG_EXTENDED_RESPONSE: u8 = 0x78;

/// Context [0] IMPLICIT SEQUENCE OF Control
const TAG_CONTROLS: u8 = 0xA0;
/// Context [3] IMPLICIT Referral inside LDAPResult
const TAG_REFERRAL: u8 = 0xA3;
/// Context [0] IMPLICIT simple authentication inside BindRequest
const TAG_AUTH_SIMPLE: u8 = 0x80;
/// Context [3] SASL authentication inside BindRequest
const TAG_AUTH_SASL: u8 = 0xA3;
/// Context [7] serverSaslCreds inside BindResponse
const TAG_SASL_CREDS: u8 = 0x87;
/// Context [0] newSuperior inside ModifyDNRequest
const TAG_NEW_SUPERIOR: u8 = 0x80;
/// Context [0]/[1] requestName/requestValue inside ExtendedRequest
const TAG_EXOP_NAME: u8 = 0x80;
const TAG_EXOP_VALUE: u8 = 0x81;
/// Context [10]/[11] responseName/responseValue inside ExtendedResponse
const TAG_EXOP_RESPONSE_NAME: u8 = 0x8A;
const TAG_EXOP_RESPONSE_VALUE: u8 = 0x8B;

fn proto<T>(msg: impl Into<String>) -> Result<T> {
    Err(LdapError::Protocol(msg.into()))
}

/// One LDAPMessage: message id, protocol operation, optional controls.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: i32,
    pub op: ProtocolOp,
    pub controls: Vec<Control>,
}

impl Message {
    pub fn new(id: i32, op: ProtocolOp) -> Self {
        Message {
            id,
            op,
            controls: Vec::new(),
        }
    }

    pub fn with_controls(id: i32, op: ProtocolOp, controls: Vec<Control>) -> Self {
        Message { id, op, controls }
    }

    /// The decoded PagedResults control value, if the message carries one.
    pub fn paged_control(&self) -> Option<PagedValue> {
        self.controls
            .iter()
            .find(|c| c.oid == PAGED_RESULTS_OID)
            .and_then(|c| c.value.as_deref())
            .and_then(|v| PagedValue::decode(v).ok())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolOp {
    BindRequest(BindRequest),
    BindResponse(LdapResult),
    UnbindRequest,
    SearchRequest(SearchRequest),
    SearchResultEntry(SearchEntry),
    SearchResultReference(Vec<String>),
    SearchResultDone(LdapResult),
    ModifyRequest(ModifyRequest),
    ModifyResponse(LdapResult),
    AddRequest(AddRequest),
    AddResponse(LdapResult),
    DelRequest(String),
    DelResponse(LdapResult),
    ModifyDnRequest(ModifyDnRequest),
    ModifyDnResponse(LdapResult),
    CompareRequest(CompareRequest),
    CompareResponse(LdapResult),
    AbandonRequest(i32),
    ExtendedRequest(ExtendedRequest),
    ExtendedResponse(ExtendedResponse),
}

impl ProtocolOp {
    /// Short operation name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolOp::BindRequest(_) => "BindRequest",
            ProtocolOp::BindResponse(_) => "BindResponse",
            ProtocolOp::UnbindRequest => "UnbindRequest",
            ProtocolOp::SearchRequest(_) => "SearchRequest",
            ProtocolOp::SearchResultEntry(_) => "SearchResultEntry",
            ProtocolOp::SearchResultReference(_) => "SearchResultReference",
            ProtocolOp::SearchResultDone(_) => "SearchResultDone",
            ProtocolOp::ModifyRequest(_) => "ModifyRequest",
            ProtocolOp::ModifyResponse(_) => "ModifyResponse",
            ProtocolOp::AddRequest(_) => "AddRequest",
            ProtocolOp::AddResponse(_) => "AddResponse",
            ProtocolOp::DelRequest(_) => "DelRequest",
            ProtocolOp::DelResponse(_) => "DelResponse",
            ProtocolOp::ModifyDnRequest(_) => "ModifyDNRequest",
            ProtocolOp::ModifyDnResponse(_) => "ModifyDNResponse",
            ProtocolOp::CompareRequest(_) => "CompareRequest",
            ProtocolOp::CompareResponse(_) => "CompareResponse",
            ProtocolOp::AbandonRequest(_) => "AbandonRequest",
            ProtocolOp::ExtendedRequest(_) => "ExtendedRequest",
            ProtocolOp::ExtendedResponse(_) => "ExtendedResponse",
        }
    }

    /// LDAPResult carried by a terminal response, if this is one.
    pub fn result(&self) -> Option<&LdapResult> {
        match self {
            ProtocolOp::BindResponse(r)
            | ProtocolOp::SearchResultDone(r)
            | ProtocolOp::ModifyResponse(r)
            | ProtocolOp::AddResponse(r)
            | ProtocolOp::DelResponse(r)
            | ProtocolOp::ModifyDnResponse(r)
            | ProtocolOp::CompareResponse(r) => Some(r),
            ProtocolOp::ExtendedResponse(r) => Some(&r.result),
            _ => None,
        }
    }
}

/// Shared response envelope: result code, matched DN, diagnostic message,
/// optional referral URIs.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LdapResult {
    pub code: u32,
    pub matched_dn: String,
    pub message: String,
    pub referrals: Vec<String>,
}

impl LdapResult {
    pub fn success() -> Self {
        LdapResult::default()
    }

    pub fn with_code(code: u32) -> Self {
        LdapResult {
            code,
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

/// Simple bind only; SASL is out of scope.
#[derive(Debug, Clone, PartialEq)]
pub struct BindRequest {
    pub version: i32,
    pub dn: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Base = 0,
    OneLevel = 1,
    Subtree = 2,
}

impl TryFrom<u32> for Scope {
    type Error = LdapError;
    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Scope::Base),
            1 => Ok(Scope::OneLevel),
            2 => Ok(Scope::Subtree),
            other => proto(format!("invalid search scope: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DerefAliases {
    #[default]
    Never = 0,
    InSearching = 1,
    FindingBase = 2,
    Always = 3,
}

impl TryFrom<u32> for DerefAliases {
    type Error = LdapError;
    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(DerefAliases::Never),
            1 => Ok(DerefAliases::InSearching),
            2 => Ok(DerefAliases::FindingBase),
            3 => Ok(DerefAliases::Always),
            other => proto(format!("invalid derefAliases: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub base: String,
    pub scope: Scope,
    pub deref: DerefAliases,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchEntry {
    pub dn: String,
    pub attributes: Vec<Attribute>,
}

impl SearchEntry {
    /// First value of the named attribute, lossily decoded as UTF-8.
    pub fn attr_first(&self, name: &str) -> Option<String> {
        self.attributes
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
            .and_then(|a| a.values.first())
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub values: Vec<Vec<u8>>,
}

impl Attribute {
    pub fn new<S, V>(name: S, values: impl IntoIterator<Item = V>) -> Self
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        Attribute {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOp {
    Add = 0,
    Delete = 1,
    Replace = 2,
}

impl TryFrom<u32> for ModifyOp {
    type Error = LdapError;
    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(ModifyOp::Add),
            1 => Ok(ModifyOp::Delete),
            2 => Ok(ModifyOp::Replace),
            other => proto(format!("invalid modify operation: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub op: ModifyOp,
    pub attribute: Attribute,
}

impl Change {
    pub fn add(attribute: Attribute) -> Self {
        Change {
            op: ModifyOp::Add,
            attribute,
        }
    }

    pub fn delete(attribute: Attribute) -> Self {
        Change {
            op: ModifyOp::Delete,
            attribute,
        }
    }

    pub fn replace(attribute: Attribute) -> Self {
        Change {
            op: ModifyOp::Replace,
            attribute,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModifyRequest {
    pub dn: String,
    pub changes: Vec<Change>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AddRequest {
    pub dn: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModifyDnRequest {
    pub dn: String,
    pub new_rdn: String,
    pub delete_old_rdn: bool,
    pub new_superior: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompareRequest {
    pub dn: String,
    pub attribute: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtendedRequest {
    pub name: String,
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtendedResponse {
    pub result: LdapResult,
    pub name: Option<String>,
    pub value: Option<Vec<u8>>,
}

/// Request or response control. The value stays opaque unless a caller
/// asks for a structural interpretation (PagedResults).
#[derive(Debug, Clone, PartialEq)]
pub struct Control {
    pub oid: String,
    pub criticality: bool,
    pub value: Option<Vec<u8>>,
}

impl Control {
    pub fn new(oid: impl Into<String>, criticality: bool, value: Option<Vec<u8>>) -> Self {
        Control {
            oid: oid.into(),
            criticality,
            value,
        }
    }

    /// PagedResults request control with an empty cookie.
    pub fn paged(page_size: i32) -> Self {
        Control {
            oid: PAGED_RESULTS_OID.to_string(),
            criticality: false,
            value: Some(
                PagedValue {
                    size: page_size,
                    cookie: Vec::new(),
                }
                .encode(),
            ),
        }
    }
}

/// PagedResults control value: `SEQUENCE { size INTEGER, cookie OCTET STRING }`.
#[derive(Debug, Clone, PartialEq)]
pub struct PagedValue {
    pub size: i32,
    pub cookie: Vec<u8>,
}

impl PagedValue {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = BerReader::new(data);
        let mut seq = r.read_sequence()?;
        let size = seq.read_integer()? as i32;
        let cookie = seq.read_octet_string()?.to_vec();
        Ok(PagedValue { size, cookie })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = BerWriter::new();
        let seq = w.begin(TAG_SEQUENCE);
        w.write_integer(self.size as i64);
        w.write_octet_string(&self.cookie);
        w.end(seq);
        w.into_vec()
    }
}

/// Total size of the first TLV in `buf` (tag + length + content, plus the
/// end-of-contents marker for indefinite lengths). `None` means more bytes
/// are needed; malformed tags and oversized lengths are errors.
pub(crate) fn measure_tlv(buf: &[u8]) -> Result<Option<usize>> {
    if buf.is_empty() {
        return Ok(None);
    }
    let constructed = buf[0] & 0x20 != 0;
    let mut pos = 1usize;
    if buf[0] & 0x1F == 0x1F {
        // high tag number form
        loop {
            if pos >= buf.len() {
                return Ok(None);
            }
            let b = buf[pos];
            pos += 1;
            if pos > 6 {
                return proto("tag too long");
            }
            if b & 0x80 == 0 {
                break;
            }
        }
    }
    if pos >= buf.len() {
        return Ok(None);
    }
    let first = buf[pos];
    pos += 1;
    if first & 0x80 == 0 {
        let len = first as usize;
        return Ok(if buf.len() >= pos + len {
            Some(pos + len)
        } else {
            None
        });
    }
    if first == 0x80 {
        if !constructed {
            return proto("indefinite length on a primitive value");
        }
        loop {
            if buf.len() < pos + 2 {
                return Ok(None);
            }
            if buf[pos] == 0 && buf[pos + 1] == 0 {
                return Ok(Some(pos + 2));
            }
            match measure_tlv(&buf[pos..])? {
                Some(n) => pos += n,
                None => return Ok(None),
            }
        }
    }
    let nlen = (first & 0x7F) as usize;
    if nlen > 4 {
        return proto(format!("length encoding too large: {} bytes", nlen));
    }
    if buf.len() < pos + nlen {
        return Ok(None);
    }
    let mut len = 0usize;
    for i in 0..nlen {
        len = (len << 8) | buf[pos + i] as usize;
    }
    pos += nlen;
    Ok(if buf.len() >= pos + len {
        Some(pos + len)
    } else {
        None
    })
}

/// Cursor over a BER-encoded slice.
pub(crate) struct BerReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BerReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        BerReader { buf, pos: 0 }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn peek_tag(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn read_tag(&mut self) -> Result<u8> {
        match self.buf.get(self.pos) {
            Some(&t) => {
                if t & 0x1F == 0x1F {
                    return proto("multi-byte tags are not used by LDAP");
                }
                self.pos += 1;
                Ok(t)
            }
            None => proto("truncated: expected tag"),
        }
    }

    /// Length octets; `None` means indefinite form.
    fn read_length(&mut self) -> Result<Option<usize>> {
        let first = match self.buf.get(self.pos) {
            Some(&b) => b,
            None => return proto("truncated: expected length"),
        };
        self.pos += 1;
        if first & 0x80 == 0 {
            return Ok(Some(first as usize));
        }
        if first == 0x80 {
            return Ok(None);
        }
        let nlen = (first & 0x7F) as usize;
        if nlen > 4 {
            return proto(format!("length encoding too large: {} bytes", nlen));
        }
        if self.remaining() < nlen {
            return proto("truncated length encoding");
        }
        let mut len = 0usize;
        for _ in 0..nlen {
            len = (len << 8) | self.buf[self.pos] as usize;
            self.pos += 1;
        }
        Ok(Some(len))
    }

    /// Content octets for a TLV whose tag has been consumed. For the
    /// indefinite form the matching end-of-contents marker is located by
    /// walking the nested TLVs; the marker is consumed but not returned.
    fn read_content(&mut self, len: Option<usize>, constructed: bool) -> Result<&'a [u8]> {
        match len {
            Some(n) => {
                if self.remaining() < n {
                    return proto(format!(
                        "truncated: need {} content bytes, {} remaining",
                        n,
                        self.remaining()
                    ));
                }
                let content = &self.buf[self.pos..self.pos + n];
                self.pos += n;
                Ok(content)
            }
            None => {
                if !constructed {
                    return proto("indefinite length on a primitive value");
                }
                let rest = &self.buf[self.pos..];
                let mut off = 0usize;
                loop {
                    if rest.len() < off + 2 {
                        return proto("unterminated indefinite length");
                    }
                    if rest[off] == 0 && rest[off + 1] == 0 {
                        let content = &rest[..off];
                        self.pos += off + 2;
                        return Ok(content);
                    }
                    match measure_tlv(&rest[off..])? {
                        Some(n) => off += n,
                        None => return proto("truncated element inside indefinite length"),
                    }
                }
            }
        }
    }

    /// Read one TLV of any tag, returning (tag, content).
    pub(crate) fn read_any(&mut self) -> Result<(u8, &'a [u8])> {
        let tag = self.read_tag()?;
        let len = self.read_length()?;
        let content = self.read_content(len, tag & 0x20 != 0)?;
        Ok((tag, content))
    }

    /// Read one TLV requiring an exact tag.
    pub(crate) fn expect(&mut self, tag: u8, what: &str) -> Result<&'a [u8]> {
        let t = self.read_tag()?;
        if t != tag {
            return proto(format!(
                "expected {} (0x{:02X}), got tag 0x{:02X}",
                what, tag, t
            ));
        }
        let len = self.read_length()?;
        self.read_content(len, t & 0x20 != 0)
    }

    pub(crate) fn read_sequence(&mut self) -> Result<BerReader<'a>> {
        Ok(BerReader::new(self.expect(TAG_SEQUENCE, "SEQUENCE")?))
    }

    pub(crate) fn read_integer(&mut self) -> Result<i64> {
        parse_int(self.expect(TAG_INTEGER, "INTEGER")?)
    }

    pub(crate) fn read_enumerated(&mut self) -> Result<u32> {
        let v = parse_int(self.expect(TAG_ENUMERATED, "ENUMERATED")?)?;
        if !(0..=u32::MAX as i64).contains(&v) {
            return proto(format!("enumerated value out of range: {}", v));
        }
        Ok(v as u32)
    }

    pub(crate) fn read_boolean(&mut self) -> Result<bool> {
        let content = self.expect(TAG_BOOLEAN, "BOOLEAN")?;
        if content.len() != 1 {
            return proto(format!("boolean must be 1 byte, got {}", content.len()));
        }
        Ok(content[0] != 0)
    }

    pub(crate) fn read_octet_string(&mut self) -> Result<&'a [u8]> {
        self.expect(TAG_OCTET_STRING, "OCTET STRING")
    }

    pub(crate) fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_octet_string()?;
        match std::str::from_utf8(bytes) {
            Ok(s) => Ok(s.to_string()),
            Err(_) => proto("invalid UTF-8 in string value"),
        }
    }
}

pub(crate) fn parse_int(content: &[u8]) -> Result<i64> {
    if content.is_empty() {
        return proto("empty INTEGER content");
    }
    if content.len() > 8 {
        return proto(format!("INTEGER too large: {} bytes", content.len()));
    }
    let mut value: i64 = if content[0] & 0x80 != 0 { -1 } else { 0 };
    for &b in content {
        value = (value << 8) | b as i64;
    }
    Ok(value)
}

/// Minimal two's-complement content octets for an integer value.
pub(crate) fn int_content(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 7 {
        let cur = bytes[start];
        let next_msb = bytes[start + 1] & 0x80;
        if (cur == 0x00 && next_msb == 0) || (cur == 0xFF && next_msb != 0) {
            start += 1;
        } else {
            break;
        }
    }
    bytes[start..].to_vec()
}

/// Append-only BER writer emitting definite lengths.
pub(crate) struct BerWriter {
    buf: Vec<u8>,
}

impl BerWriter {
    pub(crate) fn new() -> Self {
        BerWriter { buf: Vec::new() }
    }

    pub(crate) fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    fn write_length(&mut self, length: usize) {
        if length < 128 {
            self.buf.push(length as u8);
        } else {
            let mut bytes = Vec::new();
            let mut len = length;
            while len > 0 {
                bytes.push((len & 0xFF) as u8);
                len >>= 8;
            }
            bytes.reverse();
            self.buf.push(0x80 | bytes.len() as u8);
            self.buf.extend_from_slice(&bytes);
        }
    }

    /// Raw TLV with explicit tag and content.
    pub(crate) fn write_raw(&mut self, tag: u8, content: &[u8]) {
        self.buf.push(tag);
        self.write_length(content.len());
        self.buf.extend_from_slice(content);
    }

    /// Open a constructed value. Returns a position for `end`.
    pub(crate) fn begin(&mut self, tag: u8) -> usize {
        self.buf.push(tag);
        let pos = self.buf.len();
        self.buf.push(0);
        pos
    }

    /// Back-patch the length of a constructed value opened with `begin`.
    pub(crate) fn end(&mut self, pos: usize) {
        let content_len = self.buf.len() - (pos + 1);
        if content_len < 128 {
            self.buf[pos] = content_len as u8;
        } else {
            let mut bytes = Vec::new();
            let mut len = content_len;
            while len > 0 {
                bytes.push((len & 0xFF) as u8);
                len >>= 8;
            }
            bytes.reverse();
            self.buf[pos] = 0x80 | bytes.len() as u8;
            for (i, b) in bytes.iter().enumerate() {
                self.buf.insert(pos + 1 + i, *b);
            }
        }
    }

    pub(crate) fn write_integer(&mut self, value: i64) {
        let content = int_content(value);
        self.write_raw(TAG_INTEGER, &content);
    }

    pub(crate) fn write_enumerated(&mut self, value: u32) {
        let content = int_content(value as i64);
        self.write_raw(TAG_ENUMERATED, &content);
    }

    pub(crate) fn write_boolean(&mut self, value: bool) {
        self.write_raw(TAG_BOOLEAN, &[if value { 0xFF } else { 0x00 }]);
    }

    pub(crate) fn write_octet_string(&mut self, data: &[u8]) {
        self.write_raw(TAG_OCTET_STRING, data);
    }

    pub(crate) fn write_string(&mut self, s: &str) {
        self.write_octet_string(s.as_bytes());
    }
}

/// Encode a complete LDAPMessage.
pub fn encode_message(message: &Message) -> Vec<u8> {
    let mut w = BerWriter::new();
    let outer = w.begin(TAG_SEQUENCE);
    w.write_integer(message.id as i64);
    encode_op(&mut w, &message.op);
    if !message.controls.is_empty() {
        let ctrls = w.begin(TAG_CONTROLS);
        for ctrl in &message.controls {
            let seq = w.begin(TAG_SEQUENCE);
            w.write_string(&ctrl.oid);
            if ctrl.criticality {
                w.write_boolean(true);
            }
            if let Some(value) = &ctrl.value {
                w.write_octet_string(value);
            }
            w.end(seq);
        }
        w.end(ctrls);
    }
    w.end(outer);
    w.into_vec()
}

fn encode_op(w: &mut BerWriter, op: &ProtocolOp) {
    match op {
        ProtocolOp::BindRequest(req) => {
            let p = w.begin(TAG_BIND_REQUEST);
            w.write_integer(req.version as i64);
            w.write_string(&req.dn);
            w.write_raw(TAG_AUTH_SIMPLE, req.password.as_bytes());
            w.end(p);
        }
        ProtocolOp::BindResponse(res) => {
            let p = w.begin(TAG_BIND_RESPONSE);
            encode_result(w, res);
            w.end(p);
        }
        ProtocolOp::UnbindRequest => {
            w.write_raw(TAG_UNBIND_REQUEST, &[]);
        }
        ProtocolOp::SearchRequest(req) => {
            let p = w.begin(TAG_SEARCH_REQUEST);
            w.write_string(&req.base);
            w.write_enumerated(req.scope as u32);
            w.write_enumerated(req.deref as u32);
            w.write_integer(req.size_limit as i64);
            w.write_integer(req.time_limit as i64);
            w.write_boolean(req.types_only);
            req.filter.encode(w);
            let attrs = w.begin(TAG_SEQUENCE);
            for attr in &req.attributes {
                w.write_string(attr);
            }
            w.end(attrs);
            w.end(p);
        }
        ProtocolOp::SearchResultEntry(entry) => {
            let p = w.begin(TAG_SEARCH_RESULT_ENTRY);
            w.write_string(&entry.dn);
            let attrs = w.begin(TAG_SEQUENCE);
            for attr in &entry.attributes {
                encode_attribute(w, attr);
            }
            w.end(attrs);
            w.end(p);
        }
        ProtocolOp::SearchResultReference(uris) => {
            let p = w.begin(TAG_SEARCH_RESULT_REFERENCE);
            for uri in uris {
                w.write_string(uri);
            }
            w.end(p);
        }
        ProtocolOp::SearchResultDone(res) => {
            let p = w.begin(TAG_SEARCH_RESULT_DONE);
            encode_result(w, res);
            w.end(p);
        }
        ProtocolOp::ModifyRequest(req) => {
            let p = w.begin(TAG_MODIFY_REQUEST);
            w.write_string(&req.dn);
            let changes = w.begin(TAG_SEQUENCE);
            for change in &req.changes {
                let c = w.begin(TAG_SEQUENCE);
                w.write_enumerated(change.op as u32);
                encode_attribute(w, &change.attribute);
                w.end(c);
            }
            w.end(changes);
            w.end(p);
        }
        ProtocolOp::ModifyResponse(res) => {
            let p = w.begin(TAG_MODIFY_RESPONSE);
            encode_result(w, res);
            w.end(p);
        }
        ProtocolOp::AddRequest(req) => {
            let p = w.begin(TAG_ADD_REQUEST);
            w.write_string(&req.dn);
            let attrs = w.begin(TAG_SEQUENCE);
            for attr in &req.attributes {
                encode_attribute(w, attr);
            }
            w.end(attrs);
            w.end(p);
        }
        ProtocolOp::AddResponse(res) => {
            let p = w.begin(TAG_ADD_RESPONSE);
            encode_result(w, res);
            w.end(p);
        }
        ProtocolOp::DelRequest(dn) => {
            w.write_raw(TAG_DEL_REQUEST, dn.as_bytes());
        }
        ProtocolOp::DelResponse(res) => {
            let p = w.begin(TAG_DEL_RESPONSE);
            encode_result(w, res);
            w.end(p);
        }
        ProtocolOp::ModifyDnRequest(req) => {
            let p = w.begin(TAG_MODIFY_DN_REQUEST);
            w.write_string(&req.dn);
            w.write_string(&req.new_rdn);
            w.write_boolean(req.delete_old_rdn);
            if let Some(sup) = &req.new_superior {
                w.write_raw(TAG_NEW_SUPERIOR, sup.as_bytes());
            }
            w.end(p);
        }
        ProtocolOp::ModifyDnResponse(res) => {
            let p = w.begin(TAG_MODIFY_DN_RESPONSE);
            encode_result(w, res);
            w.end(p);
        }
        ProtocolOp::CompareRequest(req) => {
            let p = w.begin(TAG_COMPARE_REQUEST);
            w.write_string(&req.dn);
            let ava = w.begin(TAG_SEQUENCE);
            w.write_string(&req.attribute);
            w.write_octet_string(&req.value);
            w.end(ava);
            w.end(p);
        }
        ProtocolOp::CompareResponse(res) => {
            let p = w.begin(TAG_COMPARE_RESPONSE);
            encode_result(w, res);
            w.end(p);
        }
        ProtocolOp::AbandonRequest(id) => {
            let content = int_content(*id as i64);
            w.write_raw(TAG_ABANDON_REQUEST, &content);
        }
        ProtocolOp::ExtendedRequest(req) => {
            let p = w.begin(TAG_EXTENDED_REQUEST);
            w.write_raw(TAG_EXOP_NAME, req.name.as_bytes());
            if let Some(value) = &req.value {
                w.write_raw(TAG_EXOP_VALUE, value);
            }
            w.end(p);
        }
        ProtocolOp::ExtendedResponse(res) => {
            let p = w.begin(TAG_EXTENDED_RESPONSE);
            encode_result(w, &res.result);
            if let Some(name) = &res.name {
                w.write_raw(TAG_EXOP_RESPONSE_NAME, name.as_bytes());
            }
            if let Some(value) = &res.value {
                w.write_raw(TAG_EXOP_RESPONSE_VALUE, value);
            }
            w.end(p);
        }
    }
}

fn encode_result(w: &mut BerWriter, res: &LdapResult) {
    w.write_enumerated(res.code);
    w.write_string(&res.matched_dn);
    w.write_string(&res.message);
    if !res.referrals.is_empty() {
        let r = w.begin(TAG_REFERRAL);
        for uri in &res.referrals {
            w.write_string(uri);
        }
        w.end(r);
    }
}

fn encode_attribute(w: &mut BerWriter, attr: &Attribute) {
    let seq = w.begin(TAG_SEQUENCE);
    w.write_string(&attr.name);
    let vals = w.begin(TAG_SET);
    for value in &attr.values {
        w.write_octet_string(value);
    }
    w.end(vals);
    w.end(seq);
}

/// Decode one complete LDAPMessage from `data`. The slice must hold exactly
/// one message (the framer guarantees this).
pub fn decode_message(data: &[u8]) -> Result<Message> {
    let mut outer = BerReader::new(data);
    let mut seq = outer.read_sequence()?;
    if !outer.is_empty() {
        return proto("trailing bytes after LDAPMessage");
    }
    let id = seq.read_integer()?;
    if !(0..=i32::MAX as i64).contains(&id) {
        return proto(format!("message id out of range: {}", id));
    }
    let tag = match seq.peek_tag() {
        Some(t) => t,
        None => return proto("missing protocolOp"),
    };
    let (_, content) = seq.read_any()?;
    let op = decode_op(tag, content)?;
    let controls = if seq.peek_tag() == Some(TAG_CONTROLS) {
        decode_controls(seq.expect(TAG_CONTROLS, "controls")?)?
    } else {
        Vec::new()
    };
    if !seq.is_empty() {
        return proto("trailing bytes inside LDAPMessage");
    }
    Ok(Message {
        id: id as i32,
        op,
        controls,
    })
}

fn decode_op(tag: u8, content: &[u8]) -> Result<ProtocolOp> {
    let mut r = BerReader::new(content);
    let op = match tag {
        TAG_BIND_REQUEST => {
            let version = r.read_integer()? as i32;
            let dn = r.read_string()?;
            let (auth_tag, auth) = r.read_any()?;
            match auth_tag {
                TAG_AUTH_SIMPLE => {
                    let password = match std::str::from_utf8(auth) {
                        Ok(s) => s.to_string(),
                        Err(_) => return proto("invalid UTF-8 in simple credentials"),
                    };
                    ProtocolOp::BindRequest(BindRequest {
                        version,
                        dn,
                        password,
                    })
                }
                TAG_AUTH_SASL => return proto("SASL bind is not supported"),
                other => {
                    return proto(format!("unknown bind authentication tag 0x{:02X}", other))
                }
            }
        }
        TAG_BIND_RESPONSE => {
            let result = decode_result(&mut r)?;
            // serverSaslCreds would follow for SASL; simple bind ignores it
            if r.peek_tag() == Some(TAG_SASL_CREDS) {
                let _ = r.read_any()?;
            }
            ProtocolOp::BindResponse(result)
        }
        TAG_UNBIND_REQUEST => ProtocolOp::UnbindRequest,
        TAG_SEARCH_REQUEST => {
            let base = r.read_string()?;
            let scope = Scope::try_from(r.read_enumerated()?)?;
            let deref = DerefAliases::try_from(r.read_enumerated()?)?;
            let size_limit = r.read_integer()? as i32;
            let time_limit = r.read_integer()? as i32;
            let types_only = r.read_boolean()?;
            let filter = Filter::decode(&mut r)?;
            let mut attrs = r.read_sequence()?;
            let mut attributes = Vec::new();
            while !attrs.is_empty() {
                attributes.push(attrs.read_string()?);
            }
            ProtocolOp::SearchRequest(SearchRequest {
                base,
                scope,
                deref,
                size_limit,
                time_limit,
                types_only,
                filter,
                attributes,
            })
        }
        TAG_SEARCH_RESULT_ENTRY => {
            let dn = r.read_string()?;
            let mut attrs = r.read_sequence()?;
            let mut attributes = Vec::new();
            while !attrs.is_empty() {
                attributes.push(decode_attribute(&mut attrs)?);
            }
            ProtocolOp::SearchResultEntry(SearchEntry { dn, attributes })
        }
        TAG_SEARCH_RESULT_REFERENCE => {
            let mut uris = Vec::new();
            while !r.is_empty() {
                uris.push(r.read_string()?);
            }
            ProtocolOp::SearchResultReference(uris)
        }
        TAG_SEARCH_RESULT_DONE => ProtocolOp::SearchResultDone(decode_result(&mut r)?),
        TAG_MODIFY_REQUEST => {
            let dn = r.read_string()?;
            let mut list = r.read_sequence()?;
            let mut changes = Vec::new();
            while !list.is_empty() {
                let mut change = list.read_sequence()?;
                let op = ModifyOp::try_from(change.read_enumerated()?)?;
                let attribute = decode_attribute(&mut change)?;
                changes.push(Change { op, attribute });
            }
            ProtocolOp::ModifyRequest(ModifyRequest { dn, changes })
        }
        TAG_MODIFY_RESPONSE => ProtocolOp::ModifyResponse(decode_result(&mut r)?),
        TAG_ADD_REQUEST => {
            let dn = r.read_string()?;
            let mut attrs = r.read_sequence()?;
            let mut attributes = Vec::new();
            while !attrs.is_empty() {
                attributes.push(decode_attribute(&mut attrs)?);
            }
            ProtocolOp::AddRequest(AddRequest { dn, attributes })
        }
        TAG_ADD_RESPONSE => ProtocolOp::AddResponse(decode_result(&mut r)?),
        TAG_DEL_REQUEST => {
            // [APPLICATION 10] IMPLICIT LDAPDN: the content is the DN itself
            match std::str::from_utf8(content) {
                Ok(dn) => ProtocolOp::DelRequest(dn.to_string()),
                Err(_) => return proto("invalid UTF-8 in DelRequest DN"),
            }
        }
        TAG_DEL_RESPONSE => ProtocolOp::DelResponse(decode_result(&mut r)?),
        TAG_MODIFY_DN_REQUEST => {
            let dn = r.read_string()?;
            let new_rdn = r.read_string()?;
            let delete_old_rdn = r.read_boolean()?;
            let new_superior = if r.peek_tag() == Some(TAG_NEW_SUPERIOR) {
                let (_, sup) = r.read_any()?;
                match std::str::from_utf8(sup) {
                    Ok(s) => Some(s.to_string()),
                    Err(_) => return proto("invalid UTF-8 in newSuperior"),
                }
            } else {
                None
            };
            ProtocolOp::ModifyDnRequest(ModifyDnRequest {
                dn,
                new_rdn,
                delete_old_rdn,
                new_superior,
            })
        }
        TAG_MODIFY_DN_RESPONSE => ProtocolOp::ModifyDnResponse(decode_result(&mut r)?),
        TAG_COMPARE_REQUEST => {
            let dn = r.read_string()?;
            let mut ava = r.read_sequence()?;
            let attribute = ava.read_string()?;
            let value = ava.read_octet_string()?.to_vec();
            ProtocolOp::CompareRequest(CompareRequest {
                dn,
                attribute,
                value,
            })
        }
        TAG_COMPARE_RESPONSE => ProtocolOp::CompareResponse(decode_result(&mut r)?),
        TAG_ABANDON_REQUEST => {
            // [APPLICATION 16] IMPLICIT MessageID: primitive integer content
            let id = parse_int(content)?;
            if !(0..=i32::MAX as i64).contains(&id) {
                return proto(format!("abandoned id out of range: {}", id));
            }
            ProtocolOp::AbandonRequest(id as i32)
        }
        TAG_EXTENDED_REQUEST => {
            let name = match r.peek_tag() {
                Some(TAG_EXOP_NAME) => {
                    let (_, n) = r.read_any()?;
                    match std::str::from_utf8(n) {
                        Ok(s) => s.to_string(),
                        Err(_) => return proto("invalid UTF-8 in requestName"),
                    }
                }
                _ => return proto("ExtendedRequest missing requestName"),
            };
            let value = if r.peek_tag() == Some(TAG_EXOP_VALUE) {
                let (_, v) = r.read_any()?;
                Some(v.to_vec())
            } else {
                None
            };
            ProtocolOp::ExtendedRequest(ExtendedRequest { name, value })
        }
        TAG_EXTENDED_RESPONSE => {
            let result = decode_result(&mut r)?;
            let mut name = None;
            let mut value = None;
            if r.peek_tag() == Some(TAG_EXOP_RESPONSE_NAME) {
                let (_, n) = r.read_any()?;
                name = Some(match std::str::from_utf8(n) {
                    Ok(s) => s.to_string(),
                    Err(_) => return proto("invalid UTF-8 in responseName"),
                });
            }
            if r.peek_tag() == Some(TAG_EXOP_RESPONSE_VALUE) {
                let (_, v) = r.read_any()?;
                value = Some(v.to_vec());
            }
            ProtocolOp::ExtendedResponse(ExtendedResponse {
                result,
                name,
                value,
            })
        }
        other => return proto(format!("unknown protocolOp tag 0x{:02X}", other)),
    };
    // DelRequest and AbandonRequest consume the raw content directly
    if !matches!(tag, TAG_DEL_REQUEST | TAG_ABANDON_REQUEST) && !r.is_empty() {
        return proto(format!(
            "trailing bytes inside {} (tag 0x{:02X})",
            op.name(),
            tag
        ));
    }
    Ok(op)
}

fn decode_result(r: &mut BerReader<'_>) -> Result<LdapResult> {
    let code = r.read_enumerated()?;
    let matched_dn = r.read_string()?;
    let message = r.read_string()?;
    let mut referrals = Vec::new();
    if r.peek_tag() == Some(TAG_REFERRAL) {
        let mut refs = BerReader::new(r.expect(TAG_REFERRAL, "referral")?);
        while !refs.is_empty() {
            referrals.push(refs.read_string()?);
        }
    }
    Ok(LdapResult {
        code,
        matched_dn,
        message,
        referrals,
    })
}

fn decode_attribute(r: &mut BerReader<'_>) -> Result<Attribute> {
    let mut seq = r.read_sequence()?;
    let name = seq.read_string()?;
    let mut vals = BerReader::new(seq.expect(TAG_SET, "SET OF values")?);
    let mut values = Vec::new();
    while !vals.is_empty() {
        values.push(vals.read_octet_string()?.to_vec());
    }
    Ok(Attribute { name, values })
}

fn decode_controls(content: &[u8]) -> Result<Vec<Control>> {
    let mut r = BerReader::new(content);
    let mut controls = Vec::new();
    while !r.is_empty() {
        let mut seq = r.read_sequence()?;
        let oid = seq.read_string()?;
        let mut criticality = false;
        let mut value = None;
        if seq.peek_tag() == Some(TAG_BOOLEAN) {
            criticality = seq.read_boolean()?;
        }
        if seq.peek_tag() == Some(TAG_OCTET_STRING) {
            value = Some(seq.read_octet_string()?.to_vec());
        }
        controls.push(Control {
            oid,
            criticality,
            value,
        });
    }
    Ok(controls)
}
