use std::sync::Arc;

use rand::Rng;
use thiserror::Error;

use super::channel_index::ChannelIndex;
use super::store_types::Channel;

#[derive(Debug, Error)]
#[error("no channel for model: {model}")]
pub struct NoChannelError {
    pub model: String,
}

/// Picks a channel from a priority-sorted list.
///
/// The top tier is the prefix sharing the first channel's priority; when that
/// priority is <= 0 the whole list is one tier. With `ignore_first_priority`
/// and more than one tier the pick comes from the remaining tiers instead.
pub fn pick_from_tiers<R: Rng + ?Sized>(
    channels: &[Arc<Channel>],
    ignore_first_priority: bool,
    rng: &mut R,
) -> Option<Arc<Channel>> {
    let first = channels.first()?;
    let mut tier_end = channels.len();
    if first.priority > 0 {
        if let Some(end) = channels
            .iter()
            .position(|channel| channel.priority != first.priority)
        {
            tier_end = end;
        }
    }

    let idx = if ignore_first_priority && tier_end < channels.len() {
        rng.random_range(tier_end..channels.len())
    } else {
        rng.random_range(0..tier_end)
    };
    channels.get(idx).cloned()
}

#[derive(Clone, Debug)]
pub struct ChannelSelector {
    index: Arc<ChannelIndex>,
}

impl ChannelSelector {
    pub fn new(index: Arc<ChannelIndex>) -> Self {
        Self { index }
    }

    pub fn pick(
        &self,
        model: &str,
        ignore_first_priority: bool,
    ) -> Result<Arc<Channel>, NoChannelError> {
        let snapshot = self.index.snapshot();
        pick_from_tiers(
            snapshot.channels(model),
            ignore_first_priority,
            &mut rand::rng(),
        )
        .ok_or_else(|| NoChannelError {
            model: model.to_string(),
        })
    }
}
