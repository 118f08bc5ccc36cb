//! Two-state gripper seam.

use async_trait::async_trait;
use servostack_types::{Side, StackError};

/// A parallel gripper mounted on one arm.
#[async_trait]
pub trait Gripper: Send + Sync {
    /// Arm this gripper belongs to.
    fn side(&self) -> Side;

    /// Close the fingers.  Blocks until the motion has finished.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::MotionRejected`] if the gripper faults.
    async fn close(&self) -> Result<(), StackError>;

    /// Open the fingers.  With `blocking = false` the call returns once the
    /// command is accepted.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::MotionRejected`] if the gripper faults.
    async fn open(&self, blocking: bool) -> Result<(), StackError>;

    /// `true` while the fingers are closed.
    fn is_closed(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct MockGripper {
        closed: AtomicBool,
    }

    #[async_trait]
    impl Gripper for MockGripper {
        fn side(&self) -> Side {
            Side::Right
        }

        async fn close(&self) -> Result<(), StackError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn open(&self, _blocking: bool) -> Result<(), StackError> {
            self.closed.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn mock_gripper_toggle() {
        let gripper = MockGripper {
            closed: AtomicBool::new(false),
        };
        assert_eq!(gripper.side(), Side::Right);
        assert!(!gripper.is_closed());

        gripper.close().await.unwrap();
        assert!(gripper.is_closed());

        gripper.open(false).await.unwrap();
        assert!(!gripper.is_closed());
    }
}
