//! Placement selector
//!
//! Strict first-fit: the first volume, in attach order, that has writer
//! capacity and is still valid. No balancing by free space.

use std::sync::Arc;

use crate::volume::Volume;

/// What placement needs to know about a volume
pub trait Candidate {
    fn can_accept_write(&self) -> bool;
    fn is_valid(&self) -> bool;
}

impl Candidate for Volume {
    fn can_accept_write(&self) -> bool {
        Volume::can_accept_write(self)
    }

    fn is_valid(&self) -> bool {
        Volume::is_valid(self)
    }
}

impl<T: Candidate + ?Sized> Candidate for Arc<T> {
    fn can_accept_write(&self) -> bool {
        (**self).can_accept_write()
    }

    fn is_valid(&self) -> bool {
        (**self).is_valid()
    }
}

/// First eligible candidate, if any
///
/// Capacity is checked first; validity (which may query the device) only
/// for candidates that have room.
pub fn first_fit<C: Candidate>(candidates: &[C]) -> Option<&C> {
    candidates
        .iter()
        .find(|c| c.can_accept_write() && c.is_valid())
}
