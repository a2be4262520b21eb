use std::sync::Arc;

use crate::config::{MAX_SHMEM_REGION_SIZE, MIN_SHMEM_REGION_SIZE};
use crate::error::{ChannelError, ChannelResult};
use crate::shmem::ipc::SharedRegion;

const OFFSET_CLOSED: usize = 0;
const OFFSET_REGION_SIZE: usize = 1;
const OFFSET_HALVES: usize = 5;

const HALF_HEADER_LEN: usize = 8;
const OFFSET_TOTAL_SIZE: usize = 0;
const OFFSET_FINISH_FLAG: usize = 4;

/// The two half-duplex sub-regions. The creator sends on [Half::A], the opener on
///  [Half::B].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Half {
    A,
    B,
}
impl Half {
    pub fn other(&self) -> Half {
        match self {
            Half::A => Half::B,
            Half::B => Half::A,
        }
    }
}

/// One fragment header as read from a half.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FragmentHeader {
    pub total_size: usize,
    pub finish: bool,
}

/// Typed, bounds-checked view over the raw shared region. All offset arithmetic for
///  the control header and the two halves lives here.
pub struct RegionView {
    region: Arc<dyn SharedRegion>,
    region_size: usize,
    half_size: usize,
}

impl RegionView {
    /// Creator role: validate the requested size, write the control header, declare
    ///  the split point.
    pub fn create(region: Arc<dyn SharedRegion>, region_size: usize) -> ChannelResult<RegionView> {
        Self::validate_size(region_size)?;
        if region.len() < region_size {
            return Err(ChannelError::LogicError {
                detail: format!(
                    "shared region holds {} bytes, {} declared",
                    region.len(),
                    region_size
                ),
            });
        }

        region.write(OFFSET_CLOSED, &[0])?;
        region.write(OFFSET_REGION_SIZE, &(region_size as i32).to_le_bytes())?;

        Ok(RegionView {
            region,
            region_size,
            half_size: (region_size - OFFSET_HALVES) / 2,
        })
    }

    /// Opener role: read the creator's declared size and mirror the split.
    pub fn open(region: Arc<dyn SharedRegion>) -> ChannelResult<RegionView> {
        let mut size_bytes = [0u8; 4];
        region.read(OFFSET_REGION_SIZE, &mut size_bytes)?;
        let declared = i32::from_le_bytes(size_bytes);

        if declared < 0 {
            return Err(ChannelError::incorrect_data("negative declared region size"));
        }
        let region_size = declared as usize;
        Self::validate_size(region_size)?;
        if region.len() < region_size {
            return Err(ChannelError::IncorrectData {
                detail: format!(
                    "shared region holds {} bytes, creator declared {}",
                    region.len(),
                    region_size
                ),
            });
        }

        Ok(RegionView {
            region,
            region_size,
            half_size: (region_size - OFFSET_HALVES) / 2,
        })
    }

    fn validate_size(region_size: usize) -> ChannelResult<()> {
        if !(MIN_SHMEM_REGION_SIZE..=MAX_SHMEM_REGION_SIZE).contains(&region_size) {
            return Err(ChannelError::TooLarge {
                size: region_size,
                limit: MAX_SHMEM_REGION_SIZE,
            });
        }
        Ok(())
    }

    pub fn region_size(&self) -> usize {
        self.region_size
    }

    /// Payload bytes one fragment can carry per half.
    pub fn payload_capacity(&self) -> usize {
        self.half_size - HALF_HEADER_LEN
    }

    pub fn is_closed(&self) -> ChannelResult<bool> {
        let mut flag = [0u8; 1];
        self.region.read(OFFSET_CLOSED, &mut flag)?;
        Ok(flag[0] != 0)
    }

    /// Signal teardown to the peer. Blocked waiters see this on their next wake.
    pub fn mark_closed(&self) -> ChannelResult<()> {
        self.region.write(OFFSET_CLOSED, &[1])
    }

    fn half_offset(&self, half: Half) -> usize {
        match half {
            Half::A => OFFSET_HALVES,
            Half::B => OFFSET_HALVES + self.half_size,
        }
    }

    /// Write one fragment (header plus payload) into a half.
    pub fn write_fragment(&self, half: Half, payload: &[u8], finish: bool) -> ChannelResult<()> {
        if payload.len() > self.payload_capacity() {
            return Err(ChannelError::TooLarge {
                size: payload.len(),
                limit: self.payload_capacity(),
            });
        }

        let base = self.half_offset(half);
        self.region
            .write(base + OFFSET_TOTAL_SIZE, &(payload.len() as i32).to_le_bytes())?;
        self.region
            .write(base + OFFSET_FINISH_FLAG, &(finish as i32).to_le_bytes())?;
        self.region.write(base + HALF_HEADER_LEN, payload)
    }

    pub fn read_fragment_header(&self, half: Half) -> ChannelResult<FragmentHeader> {
        let base = self.half_offset(half);

        let mut total_bytes = [0u8; 4];
        self.region.read(base + OFFSET_TOTAL_SIZE, &mut total_bytes)?;
        let total = i32::from_le_bytes(total_bytes);
        if total < 0 || total as usize > self.payload_capacity() {
            return Err(ChannelError::IncorrectData {
                detail: format!("fragment declares {} bytes, capacity is {}", total, self.payload_capacity()),
            });
        }

        let mut finish_bytes = [0u8; 4];
        self.region.read(base + OFFSET_FINISH_FLAG, &mut finish_bytes)?;

        Ok(FragmentHeader {
            total_size: total as usize,
            finish: i32::from_le_bytes(finish_bytes) != 0,
        })
    }

    pub fn read_fragment_payload(&self, half: Half, dst: &mut [u8]) -> ChannelResult<()> {
        let base = self.half_offset(half);
        self.region.read(base + HALF_HEADER_LEN, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::shmem::ipc::{InProcessNamespace, IpcNamespace};
    use rstest::*;

    fn test_region(size: usize) -> Arc<dyn SharedRegion> {
        InProcessNamespace::new().create_region("region", size).unwrap()
    }

    #[rstest]
    fn test_create_then_open_mirrors_split() {
        let region = test_region(65_536);
        let creator = RegionView::create(region.clone(), 65_536).unwrap();
        let opener = RegionView::open(region).unwrap();

        assert_eq!(creator.region_size(), opener.region_size());
        assert_eq!(creator.payload_capacity(), opener.payload_capacity());
        assert_eq!(creator.payload_capacity(), (65_536 - 5) / 2 - 8);
    }

    #[rstest]
    #[case::too_small(19_999)]
    #[case::too_big(2_000_001)]
    fn test_size_bounds_rejected(#[case] size: usize) {
        let region = test_region(2_100_000);
        assert!(RegionView::create(region, size).is_err());
    }

    #[rstest]
    fn test_fragment_roundtrip_both_halves() {
        let region = test_region(20_000);
        let creator = RegionView::create(region.clone(), 20_000).unwrap();
        let opener = RegionView::open(region).unwrap();

        creator.write_fragment(Half::A, &[1, 2, 3], true).unwrap();
        opener.write_fragment(Half::B, &[9, 9], false).unwrap();

        let header = opener.read_fragment_header(Half::A).unwrap();
        assert_eq!(header, FragmentHeader { total_size: 3, finish: true });
        let mut payload = vec![0u8; header.total_size];
        opener.read_fragment_payload(Half::A, &mut payload).unwrap();
        assert_eq!(payload, vec![1, 2, 3]);

        let header = creator.read_fragment_header(Half::B).unwrap();
        assert_eq!(header, FragmentHeader { total_size: 2, finish: false });
    }

    #[rstest]
    fn test_oversized_fragment_rejected() {
        let region = test_region(20_000);
        let view = RegionView::create(region, 20_000).unwrap();
        let payload = vec![0u8; view.payload_capacity() + 1];

        let err = view.write_fragment(Half::A, &payload, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TooLarge);
    }

    #[rstest]
    fn test_closed_flag() {
        let region = test_region(20_000);
        let creator = RegionView::create(region.clone(), 20_000).unwrap();
        let opener = RegionView::open(region).unwrap();

        assert!(!opener.is_closed().unwrap());
        creator.mark_closed().unwrap();
        assert!(opener.is_closed().unwrap());
    }

    #[rstest]
    fn test_corrupt_fragment_header_rejected() {
        let region = test_region(20_000);
        let view = RegionView::create(region.clone(), 20_000).unwrap();

        // declared size beyond the half's capacity
        region.write(5, &(50_000i32).to_le_bytes()).unwrap();
        let err = view.read_fragment_header(Half::A).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IncorrectData);
    }
}
