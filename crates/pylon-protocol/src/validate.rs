use pylon_core::config::MAX_CHANNEL_LEN;
use pylon_core::{PylonError, Result};

/// A channel name must be non-empty and at most [`MAX_CHANNEL_LEN`] chars.
pub fn validate_channel(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(PylonError::InvalidChannel(
            "channel name must not be empty".to_string(),
        ));
    }
    if name.chars().count() > MAX_CHANNEL_LEN {
        return Err(PylonError::InvalidChannel(format!(
            "channel name exceeds {} chars",
            MAX_CHANNEL_LEN
        )));
    }
    Ok(())
}

/// A filter must be a non-empty list of valid channel names, bounded by the
/// per-connection subscription cap.
pub fn validate_filter(filter: &[String], max_subscriptions: usize) -> Result<()> {
    if filter.is_empty() {
        return Err(PylonError::InvalidFilter(
            "filter must name at least one channel".to_string(),
        ));
    }
    if filter.len() > max_subscriptions {
        return Err(PylonError::TooManySubscriptions {
            count: filter.len(),
            max: max_subscriptions,
        });
    }
    for channel in filter {
        validate_channel(channel).map_err(|_| {
            PylonError::InvalidFilter(format!("invalid channel in filter: {:?}", channel))
        })?;
    }
    Ok(())
}
