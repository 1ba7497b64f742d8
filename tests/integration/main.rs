//! End-to-end tests driving the full cycle against in-memory feeds, an
//! in-memory prediction store and a recording notifier.

mod mock_feeds;
mod pipeline;
