//! Conversion of raw register words into snapshot values.
//!
//! Everything in here is pure: no I/O, and the same input always produces the same snapshot.

use crate::registers::{Category, EnumTable, FIELDS, Field, RawBlocks, Rule, Value};
use crate::snapshot::{DeviceSnapshot, Section};
use tracing::trace;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("value {index} is out of range for {} (valid values are 0..{})", .table.name, .table.states.len())]
pub struct EnumOutOfRange {
    pub table: &'static EnumTable,
    pub index: u16,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("could not decode {category}.{field}")]
    Field {
        category: Category,
        field: &'static str,
        #[source]
        source: EnumOutOfRange,
    },
    #[error("register block `{0}` has not been read")]
    MissingBlock(crate::registers::Block),
    #[error("{category}.{field} is backed by {expected} registers, got {got}")]
    FieldLength { category: Category, field: &'static str, expected: u16, got: usize },
}

/// How the device name registers map to characters.
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ModelNameEncoding {
    /// The whole 16-bit register is a character code.
    #[default]
    Word,
    /// Only the low byte of each register is a character code.
    LowByte,
}

/// Interpret a register as a two's complement value in tenths.
pub fn decode_signed_tenths(word: u16) -> f64 {
    f64::from(word as i16) / 10.0
}

pub fn decode_scaled_tenths_unsigned(word: u16) -> f64 {
    f64::from(word) / 10.0
}

pub fn lookup_enum(table: &'static EnumTable, index: u16) -> Result<&'static str, EnumOutOfRange> {
    table.states.get(usize::from(index)).copied().ok_or(EnumOutOfRange { table, index })
}

/// Reassemble the NUL-padded device name, one character per register.
///
/// Only trailing NULs are removed. Register values that aren't valid characters (UTF-16
/// surrogates in the [`ModelNameEncoding::Word`] case) become U+FFFD.
pub fn decode_model_name(words: &[u16], encoding: ModelNameEncoding) -> String {
    let name = words
        .iter()
        .map(|&word| match encoding {
            ModelNameEncoding::Word => {
                char::from_u32(u32::from(word)).unwrap_or(char::REPLACEMENT_CHARACTER)
            }
            ModelNameEncoding::LowByte => char::from((word & 0xFF) as u8),
        })
        .collect::<String>();
    name.trim_end_matches('\0').to_string()
}

/// Format version components as `a.b.c`.
pub fn decode_version(words: &[u16]) -> String {
    words.iter().map(u16::to_string).collect::<Vec<_>>().join(".")
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Decoder {
    pub model_name_encoding: ModelNameEncoding,
}

impl Decoder {
    pub fn new(model_name_encoding: ModelNameEncoding) -> Self {
        Self { model_name_encoding }
    }

    pub fn decode_field(&self, field: &Field, words: &[u16]) -> Result<Value, DecodeError> {
        let &[word, ..] = words else {
            return Err(length_error(field, words));
        };
        if words.len() != usize::from(field.len) {
            return Err(length_error(field, words));
        }
        Ok(match field.rule {
            Rule::SignedTenths => Value::Decimal(decode_signed_tenths(word)),
            Rule::UnsignedTenths => Value::Decimal(decode_scaled_tenths_unsigned(word)),
            Rule::Raw => Value::Integer(u32::from(word)),
            Rule::RawTimesTen => Value::Integer(u32::from(word) * 10),
            Rule::Enum(table) => {
                let state = lookup_enum(table, word).map_err(|source| DecodeError::Field {
                    category: field.category,
                    field: field.name,
                    source,
                })?;
                Value::Text(state.to_string())
            }
            Rule::Text => Value::Text(decode_model_name(words, self.model_name_encoding)),
            Rule::Version => Value::Text(decode_version(words)),
        })
    }

    /// Decode all the fields into a snapshot.
    ///
    /// Either every field decodes, or no snapshot is produced at all.
    pub fn decode(&self, blocks: &RawBlocks) -> Result<DeviceSnapshot, DecodeError> {
        let mut sections: [Vec<(&'static str, Value)>; 5] = Default::default();
        for field in FIELDS {
            let block = blocks.get(field.block).ok_or(DecodeError::MissingBlock(field.block))?;
            let words = field.words(block);
            let value = self.decode_field(field, words)?;
            trace!(
                category = %field.category,
                field = field.name,
                raw = ?words,
                %value,
                "decoded field"
            );
            sections[field.category as usize].push((field.name, value));
        }
        let [temperatures, unit_state, air_quality, fans, model] = sections.map(Section::new);
        Ok(DeviceSnapshot { temperatures, unit_state, air_quality, fans, model })
    }
}

fn length_error(field: &Field, words: &[u16]) -> DecodeError {
    DecodeError::FieldLength {
        category: field.category,
        field: field.name,
        expected: field.len,
        got: words.len(),
    }
}
