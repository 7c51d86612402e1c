//! Log channel naming

/// Name of the pub/sub channel for a build's hook call
///
/// Channels are namespaced by build so observers of a build can find every
/// hook's output; a restart of the same hook call reuses the channel.
pub fn channel_name(build_id: i64, hook_call_id: i64) -> String {
    format!("kiln:build:{}:hook-call:{}", build_id, hook_call_id)
}
