//! Live notification feed for one recipient.
//!
//! The unread counter is tallied from the held records on every full reload
//! and adjusted incrementally in between (live pushes, reads, responses).
//! Pushes that arrive while a reload is in flight are applied immediately and
//! again on top of the reloaded page, so a reload never loses them.

use std::sync::Arc;

use feed_api::NotificationApi;
use feed_proto::{
    FeedPage, NotificationId, NotificationRecord, NotificationStatus, PageCursor, UserId,
};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{RealtimeError, RealtimeResult};
use crate::reconcile::{FeedOrder, FeedReconciler, MergeOutcome};

/// What the UI renders: newest first, with the unread tally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationView {
    pub items: Vec<NotificationRecord>,
    pub unread_count: u64,
    pub has_more: bool,
    pub loaded: bool,
}

struct FeedState {
    feed: FeedReconciler<NotificationRecord>,
    unread: u64,
    next_page: u32,
    /// Bumped by every reload; a page fetched under an older generation is
    /// discarded.
    generation: u64,
    reloading: bool,
    buffered: Vec<NotificationRecord>,
    loaded: bool,
}

impl FeedState {
    fn view(&self) -> NotificationView {
        NotificationView {
            items: self.feed.items().to_vec(),
            unread_count: self.unread,
            has_more: self.feed.has_more(),
            loaded: self.loaded,
        }
    }

    fn tally_unread(&self) -> u64 {
        self.feed.count_where(NotificationRecord::is_unread) as u64
    }

    /// Counter change implied by one merge.
    fn apply_outcome(&mut self, now_unread: bool, outcome: &MergeOutcome<NotificationRecord>) {
        let was_unread = match outcome {
            MergeOutcome::Inserted => false,
            MergeOutcome::Updated { previous } => previous.is_unread(),
            MergeOutcome::Unchanged => return,
        };
        match (was_unread, now_unread) {
            (false, true) => self.unread += 1,
            (true, false) => self.unread = self.unread.saturating_sub(1),
            _ => {}
        }
    }
}

struct FeedInner {
    user_id: UserId,
    api: Arc<dyn NotificationApi>,
    page_size: u32,
    state: Mutex<FeedState>,
    view: watch::Sender<NotificationView>,
}

impl FeedInner {
    fn publish(&self, state: &FeedState) {
        self.view.send_replace(state.view());
    }
}

#[derive(Clone)]
pub struct NotificationFeed {
    inner: Arc<FeedInner>,
}

impl std::fmt::Debug for NotificationFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationFeed").finish_non_exhaustive()
    }
}

impl NotificationFeed {
    pub fn new(user_id: UserId, api: Arc<dyn NotificationApi>, page_size: u32) -> Self {
        let (view, _) = watch::channel(NotificationView::default());
        Self {
            inner: Arc::new(FeedInner {
                user_id,
                api,
                page_size: page_size.max(1),
                state: Mutex::new(FeedState {
                    feed: FeedReconciler::new(FeedOrder::NewestFirst),
                    unread: 0,
                    next_page: 0,
                    generation: 0,
                    reloading: false,
                    buffered: Vec::new(),
                    loaded: false,
                }),
                view,
            }),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.inner.user_id
    }

    pub fn subscribe(&self) -> watch::Receiver<NotificationView> {
        self.inner.view.subscribe()
    }

    pub fn snapshot(&self) -> NotificationView {
        self.inner.view.borrow().clone()
    }

    pub fn unread_count(&self) -> u64 {
        self.inner.state.lock().unread
    }

    pub async fn load_initial(&self) -> RealtimeResult<()> {
        self.reload("initial load").await
    }

    /// Full reload of the first page; the counter is recounted from scratch.
    pub async fn resync(&self) -> RealtimeResult<()> {
        self.reload("resync").await
    }

    async fn reload(&self, reason: &'static str) -> RealtimeResult<()> {
        let inner = &self.inner;
        let generation = {
            let mut state = inner.state.lock();
            state.generation += 1;
            state.reloading = true;
            state.generation
        };

        let fetched = inner
            .api
            .fetch_notifications(inner.user_id, 0, inner.page_size)
            .await;

        let local_unread = {
            let mut state = inner.state.lock();
            if state.generation != generation {
                debug!(
                    target: "realtime.feed",
                    user_id = inner.user_id,
                    reason,
                    "reload superseded by a newer one"
                );
                return Ok(());
            }
            state.reloading = false;
            let records = match fetched {
                Ok(records) => records,
                Err(err) => {
                    state.buffered.clear();
                    warn!(
                        target: "realtime.feed",
                        user_id = inner.user_id,
                        reason,
                        error = %err,
                        "notification reload failed"
                    );
                    return Err(err.into());
                }
            };

            let page = FeedPage::from_fetch(
                PageCursor::Page(0),
                records,
                inner.page_size as usize,
            );
            state.feed.replace(page);
            let buffered = std::mem::take(&mut state.buffered);
            for record in buffered {
                state.feed.merge_live(record);
            }
            state.next_page = 1;
            state.unread = state.tally_unread();
            state.loaded = true;
            inner.publish(&state);
            info!(
                target: "realtime.feed",
                user_id = inner.user_id,
                reason,
                held = state.feed.len(),
                unread = state.unread,
                has_more = state.feed.has_more(),
                "notifications reloaded"
            );
            state.unread
        };

        match inner.api.unread_count(inner.user_id).await {
            Ok(server_unread) if server_unread != local_unread => {
                debug!(
                    target: "realtime.feed",
                    user_id = inner.user_id,
                    server_unread,
                    local_unread,
                    "server unread count differs from held records"
                );
            }
            Ok(_) => {}
            Err(err) => {
                debug!(
                    target: "realtime.feed",
                    user_id = inner.user_id,
                    error = %err,
                    "unread count check failed"
                );
            }
        }
        Ok(())
    }

    /// Fetches the next page. Returns how many records were new.
    pub async fn load_more(&self) -> RealtimeResult<usize> {
        let inner = &self.inner;
        let (generation, page) = {
            let state = inner.state.lock();
            if !state.loaded || !state.feed.has_more() {
                return Ok(0);
            }
            (state.generation, state.next_page)
        };

        let records = inner
            .api
            .fetch_notifications(inner.user_id, page, inner.page_size)
            .await?;

        let mut state = inner.state.lock();
        if state.generation != generation || state.next_page != page {
            debug!(
                target: "realtime.feed",
                user_id = inner.user_id,
                page,
                "discarding page fetched before a reload"
            );
            return Ok(0);
        }
        let merge = state.feed.merge_page(FeedPage::from_fetch(
            PageCursor::Page(page),
            records,
            inner.page_size as usize,
        ));
        for (held, outcome) in &merge.outcomes {
            state.apply_outcome(held.is_unread(), outcome);
        }
        state.next_page = page + 1;
        inner.publish(&state);
        debug!(
            target: "realtime.feed",
            user_id = inner.user_id,
            page,
            inserted = merge.inserted(),
            has_more = state.feed.has_more(),
            "notification page merged"
        );
        Ok(merge.inserted())
    }

    /// Merges a pushed notification.
    pub fn on_push(&self, record: NotificationRecord) {
        let inner = &self.inner;
        if record.recipient_id != inner.user_id {
            warn!(
                target: "realtime.feed",
                user_id = inner.user_id,
                recipient_id = record.recipient_id,
                notification_id = record.id,
                "ignoring notification for another recipient"
            );
            return;
        }
        let mut state = inner.state.lock();
        if state.reloading {
            state.buffered.push(record.clone());
        }
        let id = record.id;
        let outcome = state.feed.merge_live(record);
        let now_unread = state
            .feed
            .find(&id)
            .is_some_and(NotificationRecord::is_unread);
        state.apply_outcome(now_unread, &outcome);
        inner.publish(&state);
        debug!(
            target: "realtime.feed",
            user_id = inner.user_id,
            notification_id = id,
            outcome = ?outcome_label(&outcome),
            unread = state.unread,
            "notification pushed"
        );
    }

    pub async fn mark_read(&self, id: NotificationId) -> RealtimeResult<()> {
        self.inner.api.mark_read(id).await?;
        let mut state = self.inner.state.lock();
        let previous = state
            .feed
            .update(&id, |record| record.status = NotificationStatus::Read);
        if previous.is_some_and(|record| record.is_unread()) {
            state.unread = state.unread.saturating_sub(1);
        }
        self.inner.publish(&state);
        Ok(())
    }

    pub async fn mark_all_read(&self) -> RealtimeResult<()> {
        self.inner.api.mark_all_read(self.inner.user_id).await?;
        let mut state = self.inner.state.lock();
        state
            .feed
            .update_all(|record| record.status = NotificationStatus::Read);
        state.unread = 0;
        self.inner.publish(&state);
        Ok(())
    }

    /// Accepts or declines a message request; the record leaves the feed.
    pub async fn respond_to_request(&self, id: NotificationId, accept: bool) -> RealtimeResult<()> {
        let record = self
            .inner
            .state
            .lock()
            .feed
            .find(&id)
            .cloned()
            .ok_or(RealtimeError::UnknownNotification(id))?;
        self.inner
            .api
            .respond_to_request(id, accept, record.sender_id, record.recipient_id)
            .await?;

        let mut state = self.inner.state.lock();
        if let Some(removed) = state.feed.remove(&id) {
            if removed.is_unread() {
                state.unread = state.unread.saturating_sub(1);
            }
        }
        self.inner.publish(&state);
        info!(
            target: "realtime.feed",
            user_id = self.inner.user_id,
            notification_id = id,
            accept,
            "message request answered"
        );
        Ok(())
    }
}

fn outcome_label(outcome: &MergeOutcome<NotificationRecord>) -> &'static str {
    match outcome {
        MergeOutcome::Inserted => "inserted",
        MergeOutcome::Updated { .. } => "updated",
        MergeOutcome::Unchanged => "unchanged",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};
    use async_trait::async_trait;
    use feed_api::memory::{ApiOp, InMemoryFeedApi};
    use feed_api::ApiResult;
    use feed_proto::NotificationKind;

    const USER: UserId = 7;

    fn at(minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .and_then(|d| d.and_hms_opt(8, minute, 0))
            .expect("valid time")
    }

    fn record(id: NotificationId, kind: NotificationKind) -> NotificationRecord {
        NotificationRecord {
            id,
            kind,
            sender_id: 3,
            recipient_id: USER,
            message: format!("n{id}"),
            status: NotificationStatus::Unread,
            timestamp: at(id as u32),
            reference_id: None,
        }
    }

    fn seeded(count: i64) -> Arc<InMemoryFeedApi> {
        let api = InMemoryFeedApi::new();
        for id in 1..=count {
            api.insert_notification(record(id, NotificationKind::Opinion));
        }
        api
    }

    /// Serves fixed pages verbatim, duplicates included.
    struct FixedPages(Vec<Vec<NotificationRecord>>);

    #[async_trait]
    impl NotificationApi for FixedPages {
        async fn fetch_notifications(
            &self,
            _user_id: UserId,
            page: u32,
            _size: u32,
        ) -> ApiResult<Vec<NotificationRecord>> {
            Ok(self.0.get(page as usize).cloned().unwrap_or_default())
        }

        async fn unread_count(&self, _user_id: UserId) -> ApiResult<u64> {
            Ok(0)
        }

        async fn mark_read(&self, _id: NotificationId) -> ApiResult<()> {
            Ok(())
        }

        async fn mark_all_read(&self, _user_id: UserId) -> ApiResult<()> {
            Ok(())
        }

        async fn respond_to_request(
            &self,
            _id: NotificationId,
            _accept: bool,
            _sender_id: UserId,
            _recipient_id: UserId,
        ) -> ApiResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn push_then_mark_read_adjusts_the_counter() {
        let api = seeded(10);
        let feed = NotificationFeed::new(USER, api.clone(), 10);
        feed.load_initial().await.expect("load");
        assert_eq!(feed.unread_count(), 10);
        assert!(feed.snapshot().has_more);

        feed.on_push(record(11, NotificationKind::Upvote));
        let view = feed.snapshot();
        assert_eq!(view.items[0].id, 11);
        assert_eq!(view.unread_count, 11);

        feed.on_push(record(11, NotificationKind::Upvote));
        assert_eq!(feed.snapshot().items.len(), 11);
        assert_eq!(feed.unread_count(), 11);

        api.insert_notification(record(11, NotificationKind::Upvote));
        feed.mark_read(11).await.expect("mark read");
        let view = feed.snapshot();
        assert_eq!(view.unread_count, 10);
        assert_eq!(view.items[0].status, NotificationStatus::Read);
    }

    #[tokio::test]
    async fn resync_recounts_from_scratch() {
        let api = seeded(3);
        let feed = NotificationFeed::new(USER, api.clone(), 10);
        feed.load_initial().await.expect("load");
        feed.on_push(record(4, NotificationKind::Upvote));
        assert_eq!(feed.unread_count(), 4);

        // The push never reached the server and two records were read
        // elsewhere.
        api.mark_read(1).await.expect("server read");
        api.mark_read(2).await.expect("server read");
        feed.resync().await.expect("resync");

        let view = feed.snapshot();
        assert_eq!(view.items.len(), 3);
        assert_eq!(view.unread_count, 1);
        assert_eq!(
            view.unread_count as usize,
            view.items.iter().filter(|r| r.is_unread()).count()
        );
        assert_eq!(api.calls(ApiOp::UnreadCount), 2);
    }

    #[tokio::test]
    async fn pushes_during_reload_survive_it() {
        let api = seeded(2);
        let feed = NotificationFeed::new(USER, api.clone(), 10);
        let held = api.hold_next(ApiOp::FetchNotifications);

        let loading = {
            let feed = feed.clone();
            tokio::spawn(async move { feed.load_initial().await })
        };
        tokio::task::yield_now().await;
        feed.on_push(record(9, NotificationKind::Upvote));
        held.release();
        loading.await.expect("join").expect("load");

        let ids: Vec<_> = feed.snapshot().items.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![9, 2, 1]);
        assert_eq!(feed.unread_count(), 3);
    }

    #[tokio::test]
    async fn load_more_dedups_and_counts_new_unread() {
        let api = seeded(5);
        let feed = NotificationFeed::new(USER, api.clone(), 2);
        feed.load_initial().await.expect("load");
        assert_eq!(feed.unread_count(), 2);

        // A new record lands server-side, shifting every page by one.
        api.insert_notification(record(6, NotificationKind::Opinion));
        feed.on_push(record(6, NotificationKind::Opinion));
        assert_eq!(feed.load_more().await.expect("page 1"), 1);
        let ids: Vec<_> = feed.snapshot().items.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![6, 5, 4, 3]);
        assert_eq!(feed.unread_count(), 4);

        assert_eq!(feed.load_more().await.expect("page 2"), 2);
        assert_eq!(feed.load_more().await.expect("page 3"), 0);
        let view = feed.snapshot();
        assert_eq!(view.items.len(), 6);
        assert!(!view.has_more);
        assert_eq!(view.unread_count, 6);
    }

    #[tokio::test]
    async fn repeated_id_within_a_page_keeps_the_counter_exact() {
        let mut newer_read = record(1, NotificationKind::Opinion);
        newer_read.status = NotificationStatus::Read;
        newer_read.timestamp = at(30);
        let pages = vec![
            vec![record(2, NotificationKind::Opinion)],
            vec![record(1, NotificationKind::Opinion), newer_read],
        ];
        let feed = NotificationFeed::new(USER, Arc::new(FixedPages(pages)), 1);
        feed.load_initial().await.expect("load");
        assert_eq!(feed.unread_count(), 1);

        assert_eq!(feed.load_more().await.expect("page 1"), 1);
        let view = feed.snapshot();
        let tally = view.items.iter().filter(|r| r.is_unread()).count() as u64;
        assert_eq!(tally, 1);
        assert_eq!(view.unread_count, tally);
        assert!(view.items.iter().any(|r| r.id == 1 && !r.is_unread()));
    }

    #[tokio::test]
    async fn page_fetched_before_a_resync_is_discarded() {
        let api = seeded(4);
        let feed = NotificationFeed::new(USER, api.clone(), 2);
        feed.load_initial().await.expect("load");

        let held = api.hold_next(ApiOp::FetchNotifications);
        let paging = {
            let feed = feed.clone();
            tokio::spawn(async move { feed.load_more().await })
        };
        tokio::task::yield_now().await;
        feed.resync().await.expect("resync");
        held.release();
        assert_eq!(paging.await.expect("join").expect("page"), 0);
        assert_eq!(feed.snapshot().items.len(), 2);
    }

    #[tokio::test]
    async fn responding_removes_the_request() {
        let api = InMemoryFeedApi::new();
        api.insert_notification(record(1, NotificationKind::MessageRequest));
        let mut read = record(2, NotificationKind::MessageRequest);
        read.status = NotificationStatus::Read;
        api.insert_notification(read);
        let feed = NotificationFeed::new(USER, api.clone(), 10);
        feed.load_initial().await.expect("load");
        assert_eq!(feed.unread_count(), 1);

        feed.respond_to_request(2, false).await.expect("decline");
        assert_eq!(feed.unread_count(), 1);
        feed.respond_to_request(1, true).await.expect("accept");
        assert_eq!(feed.unread_count(), 0);
        assert!(feed.snapshot().items.is_empty());
        assert!(api.notification(1).is_none());

        assert!(matches!(
            feed.respond_to_request(1, true).await,
            Err(RealtimeError::UnknownNotification(1))
        ));
    }

    #[tokio::test]
    async fn mark_all_read_clears_the_counter() {
        let api = seeded(3);
        let feed = NotificationFeed::new(USER, api.clone(), 10);
        feed.load_initial().await.expect("load");
        feed.mark_all_read().await.expect("read all");
        let view = feed.snapshot();
        assert_eq!(view.unread_count, 0);
        assert!(view.items.iter().all(|r| !r.is_unread()));
    }

    #[tokio::test]
    async fn failed_calls_leave_state_untouched() {
        let api = seeded(2);
        let feed = NotificationFeed::new(USER, api.clone(), 10);
        feed.load_initial().await.expect("load");

        api.reject_next(ApiOp::MarkRead);
        let err = feed.mark_read(1).await.expect_err("rejected");
        assert!(err.is_auth());
        assert_eq!(feed.unread_count(), 2);

        api.fail_next(ApiOp::FetchNotifications);
        assert!(feed.resync().await.is_err());
        assert_eq!(feed.snapshot().items.len(), 2);
    }

    #[tokio::test]
    async fn foreign_pushes_are_ignored() {
        let feed = NotificationFeed::new(USER, InMemoryFeedApi::new(), 10);
        let mut stranger = record(1, NotificationKind::Opinion);
        stranger.recipient_id = USER + 1;
        feed.on_push(stranger);
        assert!(feed.snapshot().items.is_empty());
    }
}
