use regex::Regex;
use tracing::warn;

use crate::config::CrawlerConfig;

/// Decides once, at startup, whether this device is an app crawler whose
/// traffic should never reach the collector.
#[derive(Debug)]
pub struct CrawlerFilter {
    is_crawler: bool,
}

impl CrawlerFilter {
    pub fn new(config: &CrawlerConfig) -> Self {
        Self { is_crawler: detect(config) }
    }

    pub fn is_crawler(&self) -> bool {
        self.is_crawler
    }
}

fn detect(config: &CrawlerConfig) -> bool {
    if !config.ignore_crawlers {
        return false;
    }
    if let Some(device) = &config.device_name {
        if config.crawler_names.iter().any(|n| n == device) {
            return true;
        }
    }
    let Some(ua) = &config.user_agent else {
        return false;
    };
    if let Some(pattern) = &config.user_agent_pattern {
        match Regex::new(pattern) {
            Ok(re) if re.is_match(ua) => return true,
            Ok(_) => {}
            Err(e) => warn!(pattern = %pattern, error = %e, "invalid crawler user agent pattern"),
        }
    }
    config.crawler_names.iter().any(|n| ua.contains(n.as_str()))
}
