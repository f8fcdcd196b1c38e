//! Read-only management block.
//!
//! Exposes what the library last saw of the AGP link: the cached status and
//! command registers and the aperture window. Nothing here can be written.

use agplib_abi::capability::{AgpCommand, AgpStatus};
use agplib_abi::{AgpError, AgpResult, PhysAddr};

use crate::target::TargetContext;

/// Size of [`AgpInfoBlock::to_bytes`].
pub const AGP_INFO_BLOCK_SIZE: usize = 24;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AgpInfoBlock {
    pub status: AgpStatus,
    pub command: AgpCommand,
    pub aperture_base: PhysAddr,
    pub aperture_length: u32,
}

impl AgpInfoBlock {
    /// Snapshot for `target`. With no aperture programmed, base and length
    /// are zero.
    pub fn query(target: &TargetContext) -> Self {
        let (status, command) = target.globals().last_capability();
        let (aperture_base, aperture_length) = match target.aperture() {
            Some(info) => (info.base, info.len_bytes()),
            None => (PhysAddr::NULL, 0),
        };
        Self {
            status,
            command,
            aperture_base,
            aperture_length,
        }
    }

    /// Little-endian wire layout: status, command, base, length, padding.
    pub fn to_bytes(&self) -> [u8; AGP_INFO_BLOCK_SIZE] {
        let mut raw = [0u8; AGP_INFO_BLOCK_SIZE];
        raw[0..4].copy_from_slice(&self.status.0.to_le_bytes());
        raw[4..8].copy_from_slice(&self.command.0.to_le_bytes());
        raw[8..16].copy_from_slice(&self.aperture_base.as_u64().to_le_bytes());
        raw[16..20].copy_from_slice(&self.aperture_length.to_le_bytes());
        raw
    }
}

/// Copy the block into `buf`. Returns the bytes written.
pub fn query_block(target: &TargetContext, buf: &mut [u8]) -> AgpResult<usize> {
    let out = buf
        .get_mut(..AGP_INFO_BLOCK_SIZE)
        .ok_or(AgpError::InsufficientResources)?;
    out.copy_from_slice(&AgpInfoBlock::query(target).to_bytes());
    Ok(AGP_INFO_BLOCK_SIZE)
}

pub fn set_block(_target: &TargetContext, _data: &[u8]) -> AgpResult {
    Err(AgpError::NotSupported)
}

pub fn set_item(_target: &TargetContext, _item: u32, _data: &[u8]) -> AgpResult {
    Err(AgpError::NotSupported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::{APERTURE_BASE, Rig};

    #[test]
    fn test_block_reflects_last_capability_and_aperture() {
        let rig = Rig::new();
        let status = rig.target.capability().unwrap().capability.status;

        let block = AgpInfoBlock::query(&rig.target);
        assert_eq!(block.status, status);
        assert_eq!(block.aperture_base, PhysAddr(APERTURE_BASE));
        assert_eq!(block.aperture_length, 0x40_0000);

        let mut buf = [0xFFu8; 32];
        assert_eq!(query_block(&rig.target, &mut buf), Ok(AGP_INFO_BLOCK_SIZE));
        assert_eq!(&buf[0..4], &status.0.to_le_bytes());
        assert_eq!(&buf[8..16], &APERTURE_BASE.to_le_bytes());
        assert_eq!(&buf[20..24], &[0; 4]);
        assert_eq!(buf[24], 0xFF);
    }

    #[test]
    fn test_short_buffer_and_writes_are_refused() {
        let rig = Rig::new();
        let mut buf = [0u8; AGP_INFO_BLOCK_SIZE - 1];
        assert_eq!(
            query_block(&rig.target, &mut buf),
            Err(AgpError::InsufficientResources)
        );
        assert_eq!(set_block(&rig.target, &[0; 24]), Err(AgpError::NotSupported));
        assert_eq!(set_item(&rig.target, 1, &[0; 4]), Err(AgpError::NotSupported));
    }
}
