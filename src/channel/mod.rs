pub mod pairing;

use crate::config::{ChannelConfig, ContextPolicy, SecurityMode};
use crate::policy::MessageContext;

/// Resolve the context policy a message runs under, from the channel's
/// configuration and the adapter-derived context tag. Private contexts are
/// never attenuated.
pub fn context_policy_for(
    channel: &ChannelConfig,
    context: MessageContext,
) -> Option<ContextPolicy> {
    if context == MessageContext::Private {
        return None;
    }
    channel.context_policy.get(context.as_str()).cloned()
}

/// Whether a sender may interact with a channel at all, given its security
/// mode and pairing state.
pub fn sender_allowed(mode: SecurityMode, is_paired: bool) -> bool {
    match mode {
        SecurityMode::Open => true,
        SecurityMode::Pairing | SecurityMode::Allowlist => is_paired,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn channel_with_group_policy() -> ChannelConfig {
        let mut context_policy = HashMap::new();
        context_policy.insert(
            "group".to_string(),
            ContextPolicy {
                blocked_tools: vec!["memory_search".into()],
                block_destructive: true,
            },
        );
        ChannelConfig {
            id: "tg".into(),
            channel_type: "telegram".into(),
            name: "Telegram".into(),
            context_policy,
            ..ChannelConfig::default()
        }
    }

    #[test]
    fn private_context_is_never_attenuated() {
        let channel = channel_with_group_policy();
        assert!(context_policy_for(&channel, MessageContext::Private).is_none());
    }

    #[test]
    fn group_context_gets_its_policy() {
        let channel = channel_with_group_policy();
        let policy = context_policy_for(&channel, MessageContext::Group).unwrap();
        assert_eq!(policy.blocked_tools, vec!["memory_search"]);
        assert!(policy.block_destructive);
    }

    #[test]
    fn unconfigured_context_has_no_policy() {
        let channel = channel_with_group_policy();
        assert!(context_policy_for(&channel, MessageContext::Public).is_none());
    }

    #[test]
    fn open_mode_allows_unknown_senders() {
        assert!(sender_allowed(SecurityMode::Open, false));
        assert!(!sender_allowed(SecurityMode::Pairing, false));
        assert!(sender_allowed(SecurityMode::Pairing, true));
        assert!(!sender_allowed(SecurityMode::Allowlist, false));
    }
}
