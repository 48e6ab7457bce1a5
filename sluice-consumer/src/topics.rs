//! Topic enumeration.

use sluice_core::config::TopicSettings;
use sluice_core::{Result, TopicDomain, TopicName};

/// Describes the set of topics a run subscribes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    base: TopicName,
    suffix_count: u32,
}

impl TopicSpec {
    /// Create a spec.
    ///
    /// # Errors
    /// Returns a configuration error if tenant, namespace or base name is
    /// empty or contains a `/`.
    pub fn new(
        domain: TopicDomain,
        tenant: &str,
        namespace: &str,
        base_name: &str,
        suffix_count: u32,
    ) -> Result<Self> {
        let base = TopicName::new(domain, tenant, namespace, base_name)?;
        Ok(Self { base, suffix_count })
    }

    /// Build from the `[topics]` configuration section.
    ///
    /// # Errors
    /// See [`TopicSpec::new`].
    pub fn from_settings(settings: &TopicSettings) -> Result<Self> {
        Self::new(
            settings.domain,
            &settings.tenant,
            &settings.namespace,
            &settings.topic,
            settings.suffix_count,
        )
    }

    /// Number of identifiers [`TopicSpec::enumerate`] yields.
    #[must_use]
    pub fn len(&self) -> usize {
        (self.suffix_count as usize).max(1)
    }

    /// Always false: at least one topic is named.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// All topic identifiers, in increasing suffix order.
    ///
    /// A suffix count of zero yields the bare base name only.
    #[must_use]
    pub fn enumerate(&self) -> Vec<TopicName> {
        if self.suffix_count == 0 {
            return vec![self.base.clone()];
        }
        (0..self.suffix_count).map(|i| self.base.with_suffix(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_suffixed_topics() {
        let spec = TopicSpec::new(TopicDomain::Persistent, "t", "ns", "orders", 3).unwrap();
        let names: Vec<String> = spec.enumerate().iter().map(ToString::to_string).collect();
        assert_eq!(
            names,
            ["persistent://t/ns/orders0", "persistent://t/ns/orders1", "persistent://t/ns/orders2"]
        );
    }

    #[test]
    fn test_zero_suffix_is_bare_name() {
        let spec = TopicSpec::new(TopicDomain::NonPersistent, "t", "ns", "orders", 0).unwrap();
        let topics = spec.enumerate();
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].as_str(), "non-persistent://t/ns/orders");
    }

    #[test]
    fn test_from_settings_defaults() {
        let spec = TopicSpec::from_settings(&TopicSettings::default()).unwrap();
        assert_eq!(spec.enumerate()[0].as_str(), "persistent://public/default/topic");
    }

    #[test]
    fn test_invalid_parts_rejected() {
        assert!(TopicSpec::new(TopicDomain::Persistent, "t", "", "orders", 1).is_err());
    }

    proptest! {
        #[test]
        fn prop_enumerate_unique_and_ordered(count in 0u32..300) {
            let spec = TopicSpec::new(TopicDomain::Persistent, "t", "ns", "load", count).unwrap();
            let topics = spec.enumerate();

            prop_assert_eq!(topics.len(), count.max(1) as usize);
            prop_assert_eq!(topics.len(), spec.len());

            let unique: HashSet<_> = topics.iter().collect();
            prop_assert_eq!(unique.len(), topics.len());

            if count > 0 {
                for (i, topic) in topics.iter().enumerate() {
                    let suffix: usize = topic.local_name()["load".len()..].parse().unwrap();
                    prop_assert_eq!(suffix, i);
                }
            }
        }
    }
}
