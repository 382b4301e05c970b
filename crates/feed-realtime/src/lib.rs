//! Real-time delivery and reconciliation core of the social feed client.
//!
//! Push frames arrive on per-channel connections ([`ConnectionManager`]),
//! are routed to typed handlers by the [`SubscriptionRegistry`] and
//! [`EventDispatcher`], and are merged with paginated REST results by a
//! [`FeedReconciler`]. Local mutations go through the
//! [`OptimisticMutationController`]. [`RealtimeSession`] ties the pieces to
//! one logged-in user.

pub mod chat;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod notifications;
pub mod optimistic;
pub mod reconcile;
pub mod session;
pub mod subscription;
pub mod upvote;

pub use chat::{ChatConversation, ChatView};
pub use config::RealtimeConfig;
pub use connection::{
    ChannelConfig, ChannelKind, ConnectionHandle, ConnectionListener, ConnectionManager,
    ConnectionState, ListenerId,
};
pub use dispatch::{DispatchOutcome, EventDispatcher, PushHandler, SubscriptionKey};
pub use error::{DecodeError, MutationError, RealtimeError, RealtimeResult};
pub use notifications::{NotificationFeed, NotificationView};
pub use optimistic::{MutationEntry, OptimisticMutationController, PendingRequest};
pub use reconcile::{FeedItem, FeedOrder, FeedReconciler, MergeOutcome, PageMerge};
pub use session::{RealtimeSession, SessionApis, SessionEvent};
pub use subscription::{SubscriptionRegistry, SubscriptionScope};
pub use upvote::UpvoteController;
