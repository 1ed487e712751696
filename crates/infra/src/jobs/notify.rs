use tracing::warn;

use atelier_events::{JobNotification, NotificationBus};

/// Best-effort publication of job notifications.
///
/// The task store is authoritative, so a failed broadcast is logged and
/// dropped; it never fails or rolls back the job.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: JobNotification);
}

impl<B> Notifier for B
where
    B: NotificationBus<JobNotification>,
{
    fn notify(&self, notification: JobNotification) {
        let room_id = notification.room_id().clone();
        let job_id = notification.job_id();
        let status = notification.status();
        if let Err(e) = self.broadcast(&room_id, notification) {
            warn!(
                room_id = %room_id,
                job_id = %job_id,
                status = %status,
                error = %e,
                "failed to broadcast job notification"
            );
        }
    }
}
