//! Durable message storage.

mod error;
mod sqlite;

use async_trait::async_trait;

pub use error::{Result, StoreError};
pub use sqlite::SqliteMessageStore;

use crate::message::{Message, Status};

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Inserts a message without `id` (assigning one) and updates by `id`
    /// otherwise. Returns the stored message.
    async fn save(&self, message: Message) -> Result<Message>;

    /// Oldest `n` messages in `status` by reception time.
    async fn find_top_n_by_status_order_by_reception_time_asc(
        &self,
        status: Status,
        n: usize,
    ) -> Result<Vec<Message>>;

    async fn find_by_correlation_id(&self, correlation_id: &str) -> Result<Option<Message>>;

    /// Puts one `in_process` message back to `waiting_for_processing`.
    /// Returns `false` when the message is in any other state.
    async fn requeue(&self, correlation_id: &str) -> Result<bool>;

    /// Puts every `in_process` message back to `waiting_for_processing` and
    /// returns their correlation ids.
    async fn requeue_in_process(&self) -> Result<Vec<String>>;
}
