//! IPP binary codec
//!
//! Implements the encoding of RFC 8010 §3: a fixed 8-byte header followed
//! by delimited attribute groups. Values the daemon cares about get typed
//! representations (integers, booleans, strings, ranges, collections);
//! everything else is carried as raw octets so that decode → encode is
//! lossless.

use crate::err::{Error, Result};

// ---------------------------------------------------------------------------
// Delimiter tags (RFC 8010 §3.5.1)
// ---------------------------------------------------------------------------

/// Operation attributes group delimiter.
pub const TAG_OPERATION_ATTRIBUTES: u8 = 0x01;

/// Job attributes group delimiter.
pub const TAG_JOB_ATTRIBUTES: u8 = 0x02;

/// End-of-attributes-tag, terminates the attribute section.
pub const TAG_END_OF_ATTRIBUTES: u8 = 0x03;

/// Printer attributes group delimiter.
pub const TAG_PRINTER_ATTRIBUTES: u8 = 0x04;

// ---------------------------------------------------------------------------
// Value tags (RFC 8010 §3.5.2)
// ---------------------------------------------------------------------------

pub const VALUE_TAG_INTEGER: u8 = 0x21;
pub const VALUE_TAG_BOOLEAN: u8 = 0x22;
pub const VALUE_TAG_ENUM: u8 = 0x23;
pub const VALUE_TAG_RANGE: u8 = 0x33;
pub const VALUE_TAG_BEG_COLLECTION: u8 = 0x34;
pub const VALUE_TAG_END_COLLECTION: u8 = 0x37;
pub const VALUE_TAG_TEXT: u8 = 0x41;
pub const VALUE_TAG_NAME: u8 = 0x42;
pub const VALUE_TAG_KEYWORD: u8 = 0x44;
pub const VALUE_TAG_URI: u8 = 0x45;
pub const VALUE_TAG_CHARSET: u8 = 0x47;
pub const VALUE_TAG_NATURAL_LANGUAGE: u8 = 0x48;
pub const VALUE_TAG_MIME_MEDIA_TYPE: u8 = 0x49;
pub const VALUE_TAG_MEMBER_ATTR_NAME: u8 = 0x4a;

// ---------------------------------------------------------------------------
// Operations and statuses used by the probes
// ---------------------------------------------------------------------------

/// Get-Printer-Attributes operation identifier (RFC 8011 §4.2.5).
pub const OP_GET_PRINTER_ATTRIBUTES: u16 = 0x000b;

/// IPP version the probes speak.
pub const IPP_VERSION: (u8, u8) = (2, 0);

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// One attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IppValue {
    Integer(i32),
    Boolean(bool),
    Enum(i32),
    /// Any of the string-typed tags; the original tag is kept so that
    /// re-encoding is exact.
    Str(u8, String),
    /// rangeOfInteger: lower, upper.
    Range(i32, i32),
    /// Nested attribute collection.
    Collection(Vec<IppAttribute>),
    /// Anything we do not model, kept verbatim under its tag.
    Octets(u8, Vec<u8>),
}

impl IppValue {
    pub fn keyword(s: &str) -> IppValue {
        IppValue::Str(VALUE_TAG_KEYWORD, s.to_string())
    }

    pub fn tag(&self) -> u8 {
        match self {
            IppValue::Integer(_) => VALUE_TAG_INTEGER,
            IppValue::Boolean(_) => VALUE_TAG_BOOLEAN,
            IppValue::Enum(_) => VALUE_TAG_ENUM,
            IppValue::Str(tag, _) => *tag,
            IppValue::Range(_, _) => VALUE_TAG_RANGE,
            IppValue::Collection(_) => VALUE_TAG_BEG_COLLECTION,
            IppValue::Octets(tag, _) => *tag,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            IppValue::Str(_, s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            IppValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view of a dimension value: plain integers and the upper
    /// bound of a range both qualify.
    pub fn upper_int(&self) -> Option<i32> {
        match self {
            IppValue::Integer(n) | IppValue::Enum(n) => Some(*n),
            IppValue::Range(_, upper) => Some(*upper),
            _ => None,
        }
    }
}

/// A named attribute with its 1setOf values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IppAttribute {
    pub name: String,
    pub values: Vec<IppValue>,
}

impl IppAttribute {
    pub fn new(name: &str, value: IppValue) -> Self {
        Self {
            name: name.to_string(),
            values: vec![value],
        }
    }
}

/// Attribute group behind one delimiter tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IppGroup {
    pub delimiter: u8,
    pub attributes: Vec<IppAttribute>,
}

/// A complete IPP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IppMessage {
    pub version: (u8, u8),
    /// Operation id in a request, status code in a response.
    pub code: u16,
    pub request_id: u32,
    pub groups: Vec<IppGroup>,
}

impl IppMessage {
    pub fn request(operation: u16, request_id: u32) -> Self {
        Self {
            version: IPP_VERSION,
            code: operation,
            request_id,
            groups: Vec::new(),
        }
    }

    pub fn group_mut(&mut self, delimiter: u8) -> &mut IppGroup {
        let pos = match self.groups.iter().position(|g| g.delimiter == delimiter) {
            Some(pos) => pos,
            None => {
                self.groups.push(IppGroup {
                    delimiter,
                    attributes: Vec::new(),
                });
                self.groups.len() - 1
            }
        };
        &mut self.groups[pos]
    }

    /// All attributes from all printer-attributes groups, in order.
    pub fn printer_attributes(&self) -> impl Iterator<Item = &IppAttribute> {
        self.groups
            .iter()
            .filter(|g| g.delimiter == TAG_PRINTER_ATTRIBUTES)
            .flat_map(|g| g.attributes.iter())
    }

    // -- encoding ----------------------------------------------------------

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.push(self.version.0);
        out.push(self.version.1);
        out.extend_from_slice(&self.code.to_be_bytes());
        out.extend_from_slice(&self.request_id.to_be_bytes());

        for group in &self.groups {
            out.push(group.delimiter);
            for attr in &group.attributes {
                let mut name = attr.name.as_str();
                for value in &attr.values {
                    encode_value(&mut out, name, value);
                    // Additional 1setOf values carry an empty name.
                    name = "";
                }
            }
        }

        out.push(TAG_END_OF_ATTRIBUTES);
        out
    }

    // -- decoding ----------------------------------------------------------

    pub fn decode(data: &[u8]) -> Result<IppMessage> {
        let mut r = Reader { data, pos: 0 };

        if data.len() < 8 {
            return Err(Error::Ipp(format!(
                "message too short: {} bytes",
                data.len()
            )));
        }
        let version = (r.u8()?, r.u8()?);
        let code = r.u16()?;
        let request_id = r.u32()?;

        let mut groups: Vec<IppGroup> = Vec::new();
        let mut saw_end = false;

        while !r.at_end() {
            let tag = r.u8()?;

            if tag == TAG_END_OF_ATTRIBUTES {
                saw_end = true;
                break;
            }

            // Delimiter tags occupy 0x00..=0x0f.
            if tag <= 0x0f {
                groups.push(IppGroup {
                    delimiter: tag,
                    attributes: Vec::new(),
                });
                continue;
            }

            let group = groups
                .last_mut()
                .ok_or_else(|| Error::Ipp("attribute before any group delimiter".into()))?;
            decode_attribute(&mut r, tag, &mut group.attributes)?;
        }

        if !saw_end {
            return Err(Error::Ipp("missing end-of-attributes tag".into()));
        }

        Ok(IppMessage {
            version,
            code,
            request_id,
            groups,
        })
    }
}

fn encode_value(out: &mut Vec<u8>, name: &str, value: &IppValue) {
    match value {
        IppValue::Collection(members) => {
            write_tnv(out, VALUE_TAG_BEG_COLLECTION, name, &[]);
            for member in members {
                write_tnv(
                    out,
                    VALUE_TAG_MEMBER_ATTR_NAME,
                    "",
                    member.name.as_bytes(),
                );
                for v in &member.values {
                    encode_value(out, "", v);
                }
            }
            write_tnv(out, VALUE_TAG_END_COLLECTION, "", &[]);
        }
        IppValue::Integer(n) | IppValue::Enum(n) => {
            write_tnv(out, value.tag(), name, &n.to_be_bytes());
        }
        IppValue::Boolean(b) => {
            write_tnv(out, VALUE_TAG_BOOLEAN, name, &[u8::from(*b)]);
        }
        IppValue::Range(lower, upper) => {
            let mut bytes = [0u8; 8];
            bytes[..4].copy_from_slice(&lower.to_be_bytes());
            bytes[4..].copy_from_slice(&upper.to_be_bytes());
            write_tnv(out, VALUE_TAG_RANGE, name, &bytes);
        }
        IppValue::Str(tag, s) => write_tnv(out, *tag, name, s.as_bytes()),
        IppValue::Octets(tag, bytes) => write_tnv(out, *tag, name, bytes),
    }
}

/// tag, name-length, name, value-length, value.
fn write_tnv(out: &mut Vec<u8>, tag: u8, name: &str, value: &[u8]) {
    out.push(tag);
    out.extend_from_slice(&(name.len() as u16).to_be_bytes());
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value);
}

/// Decode one tag-name-value unit into the attribute list: either a new
/// named attribute, an additional 1setOf value, or a collection opener.
fn decode_attribute(r: &mut Reader, tag: u8, attributes: &mut Vec<IppAttribute>) -> Result<()> {
    let name = r.string()?;
    let value_bytes = r.bytes()?;

    let value = if tag == VALUE_TAG_BEG_COLLECTION {
        IppValue::Collection(decode_collection(r)?)
    } else {
        decode_scalar(tag, &value_bytes)?
    };

    if name.is_empty() {
        let attr = attributes
            .last_mut()
            .ok_or_else(|| Error::Ipp("additional value without an attribute".into()))?;
        attr.values.push(value);
    } else {
        attributes.push(IppAttribute {
            name,
            values: vec![value],
        });
    }
    Ok(())
}

/// Members between begCollection and its matching endCollection.
fn decode_collection(r: &mut Reader) -> Result<Vec<IppAttribute>> {
    let mut members: Vec<IppAttribute> = Vec::new();

    loop {
        let tag = r.u8()?;
        let name = r.string()?;
        let value_bytes = r.bytes()?;

        match tag {
            VALUE_TAG_END_COLLECTION => return Ok(members),
            VALUE_TAG_MEMBER_ATTR_NAME => {
                let member_name = String::from_utf8_lossy(&value_bytes).into_owned();
                members.push(IppAttribute {
                    name: member_name,
                    values: Vec::new(),
                });
            }
            VALUE_TAG_BEG_COLLECTION => {
                let value = IppValue::Collection(decode_collection(r)?);
                members
                    .last_mut()
                    .ok_or_else(|| Error::Ipp("collection value without member name".into()))?
                    .values
                    .push(value);
            }
            _ => {
                if !name.is_empty() {
                    return Err(Error::Ipp("named value inside a collection".into()));
                }
                let value = decode_scalar(tag, &value_bytes)?;
                members
                    .last_mut()
                    .ok_or_else(|| Error::Ipp("collection value without member name".into()))?
                    .values
                    .push(value);
            }
        }
    }
}

fn decode_scalar(tag: u8, bytes: &[u8]) -> Result<IppValue> {
    Ok(match tag {
        VALUE_TAG_INTEGER | VALUE_TAG_ENUM => {
            if bytes.len() != 4 {
                return Err(Error::Ipp(format!("integer of {} bytes", bytes.len())));
            }
            let n = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            if tag == VALUE_TAG_INTEGER {
                IppValue::Integer(n)
            } else {
                IppValue::Enum(n)
            }
        }
        VALUE_TAG_BOOLEAN => {
            if bytes.len() != 1 {
                return Err(Error::Ipp(format!("boolean of {} bytes", bytes.len())));
            }
            IppValue::Boolean(bytes[0] != 0)
        }
        VALUE_TAG_RANGE => {
            if bytes.len() != 8 {
                return Err(Error::Ipp(format!("range of {} bytes", bytes.len())));
            }
            IppValue::Range(
                i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
                i32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            )
        }
        VALUE_TAG_TEXT
        | VALUE_TAG_NAME
        | VALUE_TAG_KEYWORD
        | VALUE_TAG_URI
        | VALUE_TAG_CHARSET
        | VALUE_TAG_NATURAL_LANGUAGE
        | VALUE_TAG_MIME_MEDIA_TYPE
        | 0x46
        | 0x4b..=0x5f => IppValue::Str(tag, String::from_utf8_lossy(bytes).into_owned()),
        _ => IppValue::Octets(tag, bytes.to_vec()),
    })
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn u8(&mut self) -> Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| Error::Ipp("truncated message".into()))?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes([self.u8()?, self.u8()?]))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes([
            self.u8()?,
            self.u8()?,
            self.u8()?,
            self.u8()?,
        ]))
    }

    /// Length-prefixed byte string.
    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u16()? as usize;
        if self.pos + len > self.data.len() {
            return Err(Error::Ipp("truncated value".into()));
        }
        let bytes = self.data[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(bytes)
    }

    fn string(&mut self) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.bytes()?).into_owned())
    }
}
