//! Host mapping bookkeeping shared by buffers and textures.

use std::ptr::NonNull;

use crate::error::{Result, RhiError};

/// The host-visible range currently mapped by a resource, if any.
#[derive(Debug, Default)]
pub(crate) struct HostMapping {
    range: Option<(NonNull<u8>, usize)>,
}

impl HostMapping {
    pub(crate) fn check_unmapped(&self) -> Result<()> {
        match self.range {
            Some(_) => Err(RhiError::AlreadyMapped),
            None => Ok(()),
        }
    }

    pub(crate) fn require_mapped(&self) -> Result<()> {
        match self.range {
            Some(_) => Ok(()),
            None => Err(RhiError::NotMapped),
        }
    }

    /// Track `ptr` as mapped and hand out its bytes.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes until [`HostMapping::finish`]
    /// is called or the mapping is dropped.
    pub(crate) unsafe fn start(&mut self, ptr: NonNull<u8>, len: usize) -> Result<&mut [u8]> {
        self.check_unmapped()?;
        self.range = Some((ptr, len));
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), len) })
    }

    /// Stop tracking the range. The caller unmaps the memory.
    pub(crate) fn finish(&mut self) -> Result<()> {
        self.range.take().map(|_| ()).ok_or(RhiError::NotMapped)
    }

    #[inline]
    pub(crate) fn is_mapped(&self) -> bool {
        self.range.is_some()
    }

    /// Copy `data` into the mapped range at `offset`.
    pub(crate) fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let (ptr, len) = self.range.ok_or(RhiError::NotMapped)?;
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= len)
            .ok_or_else(|| {
                RhiError::invalid_argument(format!(
                    "write of {} bytes at {} exceeds mapped size {}",
                    data.len(),
                    offset,
                    len
                ))
            })?;

        let mapped = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), len) };
        mapped[offset..end].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(mapping: &mut HostMapping, memory: &mut [u8]) -> Result<()> {
        let ptr = NonNull::new(memory.as_mut_ptr()).unwrap();
        unsafe { mapping.start(ptr, memory.len()) }.map(|_| ())
    }

    #[test]
    fn mapping_twice_is_rejected() {
        let mut memory = vec![0u8; 16];
        let mut mapping = HostMapping::default();

        start(&mut mapping, &mut memory).unwrap();
        assert!(mapping.is_mapped());
        assert_eq!(start(&mut mapping, &mut memory), Err(RhiError::AlreadyMapped));
        assert_eq!(mapping.check_unmapped(), Err(RhiError::AlreadyMapped));
    }

    #[test]
    fn unmapping_requires_a_mapping() {
        let mut memory = vec![0u8; 16];
        let mut mapping = HostMapping::default();

        assert_eq!(mapping.finish(), Err(RhiError::NotMapped));
        assert_eq!(mapping.require_mapped(), Err(RhiError::NotMapped));

        start(&mut mapping, &mut memory).unwrap();
        assert_eq!(mapping.finish(), Ok(()));
        assert!(!mapping.is_mapped());
        assert_eq!(mapping.finish(), Err(RhiError::NotMapped));

        // The range can be mapped again once released.
        start(&mut mapping, &mut memory).unwrap();
        assert!(mapping.require_mapped().is_ok());
    }

    #[test]
    fn writes_land_inside_the_mapped_range() {
        let mut memory = vec![0u8; 8];
        let mut mapping = HostMapping::default();
        assert_eq!(mapping.write(0, &[1]), Err(RhiError::NotMapped));

        start(&mut mapping, &mut memory).unwrap();
        mapping.write(2, &[7, 8, 9]).unwrap();
        assert!(matches!(mapping.write(6, &[1, 2, 3]), Err(RhiError::InvalidArgument(_))));
        assert!(matches!(mapping.write(usize::MAX, &[1]), Err(RhiError::InvalidArgument(_))));
        mapping.finish().unwrap();

        assert_eq!(memory, vec![0, 0, 7, 8, 9, 0, 0, 0]);
    }
}
