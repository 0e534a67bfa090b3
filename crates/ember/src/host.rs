//! Host-side services an emitter needs from the system that owns it.

use ember_core::{Bounds, InstanceId};

/// The system instance an emitter belongs to.
pub trait HostInstance: Send + Sync {
    /// Identity passed to data interfaces when functions are bound.
    fn instance_id(&self) -> InstanceId;

    /// Whether the owning component simulates in its own local space.
    fn is_local_space(&self) -> bool {
        false
    }

    /// Whether script outputs should be captured for debugging this frame.
    fn should_capture_this_frame(&self) -> bool {
        false
    }

    /// Transforms world-space bounds into the component's local space.
    fn world_to_local(&self, bounds: Bounds) -> Bounds {
        bounds
    }
}

/// Host at the world origin with an identity transform.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StaticHost {
    /// Instance identity.
    pub id: InstanceId,
    /// Capture every frame.
    pub capture: bool,
}

impl StaticHost {
    /// Host with identity `id`.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self {
            id: InstanceId(id),
            capture: false,
        }
    }
}

impl HostInstance for StaticHost {
    fn instance_id(&self) -> InstanceId {
        self.id
    }

    fn should_capture_this_frame(&self) -> bool {
        self.capture
    }
}

/// Host translated by a fixed offset: world = local + offset.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TranslatedHost {
    /// Instance identity.
    pub id: InstanceId,
    /// Component position in world space.
    pub offset: [f32; 3],
}

impl HostInstance for TranslatedHost {
    fn instance_id(&self) -> InstanceId {
        self.id
    }

    fn world_to_local(&self, bounds: Bounds) -> Bounds {
        let mut local = Bounds::empty();
        for corner in bounds.corners() {
            local.include([
                corner[0] - self.offset[0],
                corner[1] - self.offset[1],
                corner[2] - self.offset[2],
            ]);
        }
        local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translated_host_moves_bounds() {
        let host = TranslatedHost {
            id: InstanceId(1),
            offset: [10.0, 0.0, -5.0],
        };
        let local = host.world_to_local(Bounds::new([10.0, 0.0, 0.0], [12.0, 1.0, 1.0]));
        assert_eq!(local, Bounds::new([0.0, 0.0, 5.0], [2.0, 1.0, 6.0]));
    }
}
