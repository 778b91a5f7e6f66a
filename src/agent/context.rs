//! Context providers: sources of ambient information folded into the
//! system prompt at the start of each turn.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::warn;

/// What a provider gets to work with when producing its fragment.
#[derive(Debug, Clone)]
pub struct ContextRequest {
    pub conversation_id: String,
    pub profile: String,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ContextFragment {
    /// Provider name, used as the fragment heading.
    pub source: String,
    pub content: String,
}

#[async_trait]
pub trait ContextProvider: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(None)` means the provider has nothing to add this turn.
    async fn provide(&self, request: &ContextRequest)
        -> anyhow::Result<Option<ContextFragment>>;
}

/// Run every provider concurrently. A provider that fails is logged and
/// omitted; one broken source must not take down the turn.
pub async fn aggregate(
    providers: &[&dyn ContextProvider],
    request: &ContextRequest,
) -> Vec<ContextFragment> {
    let results = join_all(providers.iter().map(|p| p.provide(request))).await;

    let mut fragments = Vec::new();
    for (provider, result) in providers.iter().zip(results) {
        match result {
            Ok(Some(fragment)) => fragments.push(fragment),
            Ok(None) => {}
            Err(e) => {
                warn!(provider = %provider.name(), error = %e, "Context provider failed");
            }
        }
    }
    fragments
}

/// Fold fragments under a shared heading. Empty input yields an empty
/// string so the system prompt is unchanged.
pub fn render_fragments(fragments: &[ContextFragment]) -> String {
    if fragments.is_empty() {
        return String::new();
    }
    let mut out = String::from("\n\n# Context\n");
    for fragment in fragments {
        out.push_str(&format!("\n## {}\n{}\n", fragment.source, fragment.content));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProvider {
        name: &'static str,
        content: Option<&'static str>,
        fail: bool,
    }

    #[async_trait]
    impl ContextProvider for FixedProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn provide(
            &self,
            _request: &ContextRequest,
        ) -> anyhow::Result<Option<ContextFragment>> {
            if self.fail {
                anyhow::bail!("source unavailable");
            }
            Ok(self.content.map(|c| ContextFragment {
                source: self.name.to_string(),
                content: c.to_string(),
            }))
        }
    }

    fn request() -> ContextRequest {
        ContextRequest {
            conversation_id: "c1".into(),
            profile: "default".into(),
            now: Utc::now(),
        }
    }

    #[tokio::test]
    async fn failing_providers_are_omitted_not_fatal() {
        let providers: Vec<Box<dyn ContextProvider>> = vec![
            Box::new(FixedProvider {
                name: "notes",
                content: Some("milk"),
                fail: false,
            }),
            Box::new(FixedProvider {
                name: "weather",
                content: Some("rainy"),
                fail: true,
            }),
            Box::new(FixedProvider {
                name: "quiet",
                content: None,
                fail: false,
            }),
        ];

        let refs: Vec<&dyn ContextProvider> = providers.iter().map(|p| p.as_ref()).collect();
        let fragments = aggregate(&refs, &request()).await;
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].source, "notes");
    }

    #[test]
    fn rendering_no_fragments_is_empty() {
        assert_eq!(render_fragments(&[]), "");
        let rendered = render_fragments(&[ContextFragment {
            source: "notes".into(),
            content: "milk".into(),
        }]);
        assert!(rendered.contains("# Context"));
        assert!(rendered.contains("## notes"));
    }
}
