use std::collections::HashMap;
use std::sync::Arc;

use feed_api::UpvoteApi;
use feed_proto::{TopicId, UpvoteState, UserId};
use futures::future::join_all;
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::error::{MutationError, RealtimeResult};
use crate::optimistic::{MutationEntry, OptimisticMutationController, PendingRequest};

/// Upvote state per topic for the session user, toggled optimistically.
#[derive(Clone)]
pub struct UpvoteController {
    user_id: UserId,
    api: Arc<dyn UpvoteApi>,
    mutations: OptimisticMutationController<TopicId, UpvoteState>,
}

impl UpvoteController {
    pub fn new(user_id: UserId, api: Arc<dyn UpvoteApi>) -> Self {
        Self {
            user_id,
            api,
            mutations: OptimisticMutationController::new(),
        }
    }

    /// Flips the local state at once and issues add or remove depending on
    /// the state before the flip.
    pub fn toggle(&self, topic_id: &TopicId) -> PendingRequest {
        let api = Arc::clone(&self.api);
        let user_id = self.user_id;
        let topic = topic_id.clone();
        self.mutations
            .apply_optimistic(topic_id.clone(), move |current: &UpvoteState| {
                let had_upvoted = current.user_has_upvoted;
                let request = async move {
                    if had_upvoted {
                        api.remove_upvote(user_id, &topic).await
                    } else {
                        api.add_upvote(user_id, &topic).await
                    }
                };
                (current.toggled(), request)
            })
    }

    /// Loads the authoritative state of `topics`. Topics with requests in
    /// flight keep their optimistic value. Returns how many were updated.
    pub async fn refresh(&self, topics: &[TopicId]) -> RealtimeResult<usize> {
        let fetches = topics.iter().map(|topic| async move {
            let (count, user_has_upvoted) = tokio::try_join!(
                self.api.upvote_count(topic),
                self.api.has_upvoted(self.user_id, topic)
            )?;
            Ok::<_, feed_api::ApiError>((
                topic.clone(),
                UpvoteState {
                    count,
                    user_has_upvoted,
                },
            ))
        });

        let mut applied = 0;
        for result in join_all(fetches).await {
            let (topic, state) = result?;
            if self.mutations.set(topic.clone(), state) {
                applied += 1;
            } else {
                debug!(
                    target: "realtime.mutation",
                    topic = %topic,
                    "refresh skipped; toggle in flight"
                );
            }
        }
        Ok(applied)
    }

    pub fn state(&self, topic_id: &TopicId) -> UpvoteState {
        self.entry(topic_id).map(|entry| entry.value).unwrap_or_default()
    }

    pub fn entry(&self, topic_id: &TopicId) -> Option<MutationEntry<UpvoteState>> {
        self.mutations.get(topic_id)
    }

    pub fn subscribe(&self) -> watch::Receiver<HashMap<TopicId, MutationEntry<UpvoteState>>> {
        self.mutations.subscribe()
    }

    pub fn subscribe_failures(&self) -> broadcast::Receiver<MutationError> {
        self.mutations.subscribe_failures()
    }
}
