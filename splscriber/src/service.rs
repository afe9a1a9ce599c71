//! Caller-side composition of a label source, the details cache and the parser.

use std::sync::Arc;

use tracing::debug;

use crate::cache::DetailsCache;
use crate::config::SplConfig;
use crate::details::{parse_label, MedicationDetails};
use crate::error::SplResult;
use crate::source::LabelSource;

pub struct LabelService<S> {
    source: S,
    cache: DetailsCache,
    config: SplConfig,
}

impl<S: LabelSource> LabelService<S> {
    pub fn new(source: S, config: SplConfig) -> Self {
        Self {
            cache: DetailsCache::from_config(&config.cache),
            source,
            config,
        }
    }

    /// Cached details for `set_id`, fetched and parsed on a miss.
    pub fn details(&self, set_id: &str) -> SplResult<Arc<MedicationDetails>> {
        if let Some(details) = self.cache.get(set_id) {
            debug!(%set_id, "details served from cache");
            return Ok(details);
        }

        let inputs = self.source.fetch(set_id)?;
        let details = Arc::new(parse_label(
            &inputs.xml,
            set_id,
            &inputs.supplementary,
            &self.config,
        )?);
        self.cache.insert(set_id, Arc::clone(&details));
        Ok(details)
    }

    /// Drop any cached copy and parse again.
    pub fn refresh(&self, set_id: &str) -> SplResult<Arc<MedicationDetails>> {
        self.cache.invalidate(set_id);
        self.details(set_id)
    }

    pub fn cache(&self) -> &DetailsCache {
        &self.cache
    }

    pub fn config(&self) -> &SplConfig {
        &self.config
    }
}
