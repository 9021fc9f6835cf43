// SPDX-License-Identifier: MIT

//! Requests-per-minute throttle for a model
//!
//! Calls beyond `max_rpm` inside a sliding sixty second window wait until the
//! oldest call falls out of the window.

use super::{Content, GenerationConfig, Model};
use crate::adk::error::BoxError;
use crate::adk::tool::Tool;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(60);

pub struct RateLimitedModel {
    inner: Arc<dyn Model>,
    max_rpm: usize,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimitedModel {
    pub fn new(inner: Arc<dyn Model>, max_rpm: u32) -> Self {
        Self {
            inner,
            max_rpm: max_rpm.max(1) as usize,
            calls: Mutex::new(VecDeque::new()),
        }
    }

    /// Reserve a slot in the window, or report how long to wait for one.
    fn try_reserve(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut calls = self.calls.lock().unwrap_or_else(|p| p.into_inner());
        while calls
            .front()
            .is_some_and(|t| now.duration_since(*t) >= WINDOW)
        {
            calls.pop_front();
        }
        if calls.len() < self.max_rpm {
            calls.push_back(now);
            return None;
        }
        calls
            .front()
            .map(|oldest| WINDOW.saturating_sub(now.duration_since(*oldest)))
    }

    async fn acquire(&self) {
        while let Some(wait) = self.try_reserve() {
            log::debug!("Rate limit of {} rpm reached, waiting {:?}", self.max_rpm, wait);
            tokio::time::sleep(wait).await;
        }
    }
}

#[async_trait]
impl Model for RateLimitedModel {
    async fn generate_content(
        &self,
        history: &[Content],
        config: Option<&GenerationConfig>,
        tools: Option<&[Arc<dyn Tool>]>,
    ) -> Result<Content, BoxError> {
        self.acquire().await;
        self.inner.generate_content(history, config, tools).await
    }
}
