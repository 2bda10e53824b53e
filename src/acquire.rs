//! A single acquisition cycle: read every register block, then decode.

use crate::connection::{self, ReadRegisters};
use crate::decode::{DecodeError, Decoder, ModelNameEncoding};
use crate::registers::{Block, LengthMismatch, RawBlocks, RegisterBlock};
use crate::snapshot::DeviceSnapshot;
use std::time::Duration;
use tracing::debug;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not read the `{block}` registers ({} to {})", .block.address(), .block.address() + .block.count() - 1)]
    Read {
        block: Block,
        #[source]
        source: connection::Error,
    },
    #[error("the `{block}` register block is incomplete")]
    Incomplete {
        block: Block,
        #[source]
        source: LengthMismatch,
    },
    #[error("could not decode the register values")]
    Decode(#[source] DecodeError),
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "acquire::Args")]
pub struct Args {
    /// Pause between consecutive register block reads.
    #[arg(long, default_value = "200ms")]
    request_delay: humantime::Duration,

    /// How the registers holding the device name are converted to characters.
    #[arg(long, value_enum, default_value_t = ModelNameEncoding::Word)]
    model_name_encoding: ModelNameEncoding,
}

impl Args {
    pub fn request_delay(&self) -> Duration {
        *self.request_delay
    }

    pub fn decoder(&self) -> Decoder {
        Decoder::new(self.model_name_encoding)
    }
}

/// Read all the register blocks in [`Block::READ_ORDER`].
///
/// Stops at the first failing block; nothing read up to that point is returned.
pub async fn read_blocks<R: ReadRegisters>(
    reader: &mut R,
    request_delay: Duration,
) -> Result<RawBlocks, Error> {
    let mut blocks = RawBlocks::new();
    for (idx, block) in Block::READ_ORDER.into_iter().enumerate() {
        if idx != 0 && !request_delay.is_zero() {
            tokio::time::sleep(request_delay).await;
        }
        debug!(message = "reading", %block, address = block.address(), count = block.count());
        let words = reader
            .read_input_registers(block.address(), block.count())
            .await
            .map_err(|source| Error::Read { block, source })?;
        let words =
            RegisterBlock::new(block, words).map_err(|source| Error::Incomplete { block, source })?;
        blocks.insert(words);
    }
    Ok(blocks)
}

/// Run a complete acquisition cycle, producing a snapshot only if every block was read and
/// decoded successfully.
pub async fn acquire<R: ReadRegisters>(
    reader: &mut R,
    request_delay: Duration,
    decoder: &Decoder,
) -> Result<DeviceSnapshot, Error> {
    let blocks = read_blocks(reader, request_delay).await?;
    decoder.decode(&blocks).map_err(Error::Decode)
}
