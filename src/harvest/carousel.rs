//! Interaction-driven enumeration of carousel media.
//!
//! Carousels usually keep only the active slide's image in the DOM, so the
//! static snapshot undercounts them. The resolver clicks through each
//! indicator and collects whatever becomes visible.

use std::time::Duration;
use tracing::{debug, warn};

use crate::config::StrategyConfig;
use crate::harvest::extract::{MediaFilter, RawMedia};
use crate::harvest::scripts;
use crate::model::MediaSet;
use crate::traits::{BrowserSession, Interaction, SessionError};

pub struct CarouselResolver {
    strategies: StrategyConfig,
    filter: MediaFilter,
    settle: Duration,
}

impl CarouselResolver {
    pub fn new(strategies: StrategyConfig, filter: MediaFilter, settle: Duration) -> Self {
        Self {
            strategies,
            filter,
            settle,
        }
    }

    /// Returns every allow-listed media URL revealed by activating the
    /// container's indicators in order. With at most one indicator the
    /// currently visible media is returned unchanged.
    pub async fn resolve<B>(
        &self,
        session: &B,
        container_selector: &str,
        ordinal: usize,
    ) -> Result<Vec<String>, SessionError>
    where
        B: BrowserSession + ?Sized,
    {
        let containers = session.find(container_selector).await?;
        let container = containers.get(ordinal).ok_or_else(|| {
            SessionError::NoSuchElement(format!("{} [{}]", container_selector, ordinal))
        })?;

        let indicators = session
            .find_within(container, &self.strategies.indicator_selector)
            .await?;

        if indicators.len() <= 1 {
            return Ok(self
                .visible(session, container_selector, ordinal)
                .await?
                .into_vec());
        }

        let mut collected = MediaSet::new();
        for (position, indicator) in indicators.iter().enumerate() {
            if let Err(e) = session.interact(Interaction::Click(indicator.clone())).await {
                warn!(ordinal, indicator = position, error = %e, "Indicator activation failed");
                continue;
            }
            tokio::time::sleep(self.settle).await;

            match self.visible(session, container_selector, ordinal).await {
                Ok(urls) => collected.extend(urls.into_vec()),
                Err(e) => {
                    warn!(ordinal, indicator = position, error = %e, "Reading slide media failed")
                }
            }
        }

        debug!(
            ordinal,
            indicators = indicators.len(),
            found = collected.len(),
            "Carousel walked"
        );
        Ok(collected.into_vec())
    }

    async fn visible<B>(
        &self,
        session: &B,
        container_selector: &str,
        ordinal: usize,
    ) -> Result<MediaSet, SessionError>
    where
        B: BrowserSession + ?Sized,
    {
        let value = session
            .query(scripts::visible_media(
                container_selector,
                ordinal,
                &self.strategies,
            ))
            .await?;
        let raw: RawMedia = serde_json::from_value(value)
            .map_err(|e| SessionError::Protocol(format!("visible media payload: {}", e)))?;
        Ok(self.filter.collect(&raw))
    }
}
