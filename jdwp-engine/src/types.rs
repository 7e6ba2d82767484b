// JDWP type definitions
//
// Common types used across the JDWP protocol

use crate::protocol::CodecError;
use crate::reader::{read_i32, read_i64, read_u16, read_u64, read_u8};
use bytes::BufMut;
use serde::{Deserialize, Serialize};

// Object IDs are 8 bytes in JDWP
pub type ObjectId = u64;
pub type ThreadId = ObjectId;
pub type ReferenceTypeId = u64;
pub type MethodId = u64;
pub type FieldId = u64;
pub type FrameId = u64;

// Location identifies a code position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub type_tag: u8, // 1=class, 2=interface, 3=array
    pub class_id: ReferenceTypeId,
    pub method_id: MethodId,
    pub index: u64, // bytecode index (PC)
}

impl Location {
    pub fn new(class_id: ReferenceTypeId, method_id: MethodId, index: u64) -> Self {
        Self {
            type_tag: 1,
            class_id,
            method_id,
            index,
        }
    }

    /// The all-zero location the target sends for "no location"
    pub fn is_null(&self) -> bool {
        self.type_tag == 0 && self.class_id == 0 && self.method_id == 0 && self.index == 0
    }

    pub fn write(&self, buf: &mut Vec<u8>) {
        buf.put_u8(self.type_tag);
        buf.put_u64(self.class_id);
        buf.put_u64(self.method_id);
        buf.put_u64(self.index);
    }
}

/// Suspend policy for events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SuspendPolicy {
    None = 0,
    EventThread = 1,
    All = 2,
}

impl TryFrom<u8> for SuspendPolicy {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            0 => Ok(SuspendPolicy::None),
            1 => Ok(SuspendPolicy::EventThread),
            2 => Ok(SuspendPolicy::All),
            other => Err(CodecError::Malformed(format!("Unknown suspend policy: {}", other))),
        }
    }
}

/// Step granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum StepSize {
    Min = 0,
    Line = 1,
}

/// Step depth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum StepDepth {
    Into = 0,
    Over = 1,
    Out = 2,
}

// Thread status values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ThreadStatus {
    Zombie = 0,
    Running = 1,
    Sleeping = 2,
    Monitor = 3,
    Wait = 4,
}

impl ThreadStatus {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(ThreadStatus::Zombie),
            1 => Some(ThreadStatus::Running),
            2 => Some(ThreadStatus::Sleeping),
            3 => Some(ThreadStatus::Monitor),
            4 => Some(ThreadStatus::Wait),
            _ => None,
        }
    }
}

// Suspend status bit reported by ThreadReference.Status
pub const SUSPEND_STATUS_SUSPENDED: i32 = 1;

// Type tags for values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TypeTag {
    Array = 91,        // '['
    Byte = 66,         // 'B'
    Char = 67,         // 'C'
    Object = 76,       // 'L'
    Float = 70,        // 'F'
    Double = 68,       // 'D'
    Int = 73,          // 'I'
    Long = 74,         // 'J'
    Short = 83,        // 'S'
    Void = 86,         // 'V'
    Boolean = 90,      // 'Z'
    String = 115,      // 's'
    Thread = 116,      // 't'
    ThreadGroup = 103, // 'g'
    ClassLoader = 108, // 'l'
    ClassObject = 99,  // 'c'
}

// Tagged value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Value {
    pub tag: u8,
    pub data: ValueData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueData {
    Byte(i8),
    Char(u16),
    Float(f32),
    Double(f64),
    Int(i32),
    Long(i64),
    Short(i16),
    Boolean(bool),
    Object(ObjectId),
    Void,
}

impl Value {
    pub fn int(v: i32) -> Self {
        Self {
            tag: TypeTag::Int as u8,
            data: ValueData::Int(v),
        }
    }

    pub fn long(v: i64) -> Self {
        Self {
            tag: TypeTag::Long as u8,
            data: ValueData::Long(v),
        }
    }

    pub fn boolean(v: bool) -> Self {
        Self {
            tag: TypeTag::Boolean as u8,
            data: ValueData::Boolean(v),
        }
    }

    pub fn object(tag: TypeTag, id: ObjectId) -> Self {
        Self {
            tag: tag as u8,
            data: ValueData::Object(id),
        }
    }

    /// Write tag byte followed by the untagged value
    pub fn write_tagged(&self, buf: &mut Vec<u8>) {
        buf.put_u8(self.tag);
        self.write_untagged(buf);
    }

    pub fn write_untagged(&self, buf: &mut Vec<u8>) {
        match self.data {
            ValueData::Byte(v) => buf.put_i8(v),
            ValueData::Char(v) => buf.put_u16(v),
            ValueData::Float(v) => buf.put_f32(v),
            ValueData::Double(v) => buf.put_f64(v),
            ValueData::Int(v) => buf.put_i32(v),
            ValueData::Long(v) => buf.put_i64(v),
            ValueData::Short(v) => buf.put_i16(v),
            ValueData::Boolean(v) => buf.put_u8(v as u8),
            ValueData::Object(id) => buf.put_u64(id),
            ValueData::Void => {}
        }
    }
}

/// Read a tag byte followed by the value it describes
pub fn read_tagged_value(buf: &mut &[u8]) -> Result<Value, CodecError> {
    let tag = read_u8(buf)?;
    let data = read_value_by_tag(tag, buf)?;
    Ok(Value { tag, data })
}

/// Read a value based on its type tag
pub fn read_value_by_tag(tag: u8, buf: &mut &[u8]) -> Result<ValueData, CodecError> {
    match tag {
        // 'B' = byte
        66 => Ok(ValueData::Byte(read_u8(buf)? as i8)),
        // 'C' = char
        67 => Ok(ValueData::Char(read_u16(buf)?)),
        // 'D' = double
        68 => Ok(ValueData::Double(f64::from_bits(read_u64(buf)?))),
        // 'F' = float
        70 => Ok(ValueData::Float(f32::from_bits(read_i32(buf)? as u32))),
        // 'I' = int
        73 => Ok(ValueData::Int(read_i32(buf)?)),
        // 'J' = long
        74 => Ok(ValueData::Long(read_i64(buf)?)),
        // 'S' = short
        83 => Ok(ValueData::Short(read_u16(buf)? as i16)),
        // 'Z' = boolean
        90 => Ok(ValueData::Boolean(read_u8(buf)? != 0)),
        // 'V' = void
        86 => Ok(ValueData::Void),
        // Object types (L, s, t, g, l, c, [)
        76 | 115 | 116 | 103 | 108 | 99 | 91 => Ok(ValueData::Object(read_u64(buf)?)),
        _ => Err(CodecError::Malformed(format!("Unknown value tag: {}", tag))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspend_policy_orders_by_strictness() {
        assert!(SuspendPolicy::All > SuspendPolicy::EventThread);
        assert!(SuspendPolicy::EventThread > SuspendPolicy::None);
        assert!(SuspendPolicy::try_from(3).is_err());
    }

    #[test]
    fn tagged_values_read_back() {
        let values = vec![
            Value::int(-5),
            Value::long(1 << 40),
            Value::boolean(true),
            Value::object(TypeTag::String, 0xabcd),
            Value {
                tag: TypeTag::Double as u8,
                data: ValueData::Double(2.5),
            },
        ];

        let mut buf = Vec::new();
        for v in &values {
            v.write_tagged(&mut buf);
        }

        let mut data = &buf[..];
        for v in &values {
            assert_eq!(&read_tagged_value(&mut data).unwrap(), v);
        }
        assert!(data.is_empty());
    }

    #[test]
    fn unknown_tag_is_malformed() {
        let data = [b'?', 0, 0];
        let mut buf = &data[..];
        assert!(read_tagged_value(&mut buf).is_err());
    }

    #[test]
    fn null_location() {
        assert!(Location {
            type_tag: 0,
            class_id: 0,
            method_id: 0,
            index: 0
        }
        .is_null());
        assert!(!Location::new(1, 2, 3).is_null());
    }
}
