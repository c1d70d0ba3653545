use tracing::{debug, warn};

/// A prompt transformer invoked before generation. Plugins are opaque
/// string appenders from the generator's point of view; concrete
/// implementations (time-of-day, holiday, art-style, LoRA selection) live
/// with the embedding application.
pub trait PromptPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Produce the augmented prompt. Errors are absorbed by the pipeline.
    fn apply(&self, prompt: &str) -> anyhow::Result<String>;
}

/// Ordered chain of prompt transformers.
#[derive(Default)]
pub struct PluginPipeline {
    plugins: Vec<Box<dyn PromptPlugin>>,
}

impl PluginPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, plugin: Box<dyn PromptPlugin>) {
        self.plugins.push(plugin);
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Run every plugin in order. A failing plugin is skipped with a
    /// warning; prompt augmentation must never abort generation.
    pub fn run(&self, prompt: &str) -> String {
        let mut current = prompt.to_string();
        for plugin in &self.plugins {
            match plugin.apply(&current) {
                Ok(next) => {
                    debug!(plugin = plugin.name(), "applied prompt plugin");
                    current = next;
                }
                Err(e) => {
                    warn!(plugin = plugin.name(), "prompt plugin failed, skipping: {e}");
                }
            }
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Suffix(&'static str);

    impl PromptPlugin for Suffix {
        fn name(&self) -> &str {
            "suffix"
        }

        fn apply(&self, prompt: &str) -> anyhow::Result<String> {
            Ok(format!("{prompt}, {}", self.0))
        }
    }

    struct Broken;

    impl PromptPlugin for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn apply(&self, _prompt: &str) -> anyhow::Result<String> {
            anyhow::bail!("no context available")
        }
    }

    #[test]
    fn plugins_chain_in_order() {
        let mut pipeline = PluginPipeline::new();
        pipeline.push(Box::new(Suffix("golden hour")));
        pipeline.push(Box::new(Suffix("oil painting")));
        assert_eq!(
            pipeline.run("a red cube"),
            "a red cube, golden hour, oil painting"
        );
    }

    #[test]
    fn failing_plugin_is_skipped_not_fatal() {
        let mut pipeline = PluginPipeline::new();
        pipeline.push(Box::new(Broken));
        pipeline.push(Box::new(Suffix("watercolor")));
        assert_eq!(pipeline.run("a red cube"), "a red cube, watercolor");
    }

    #[test]
    fn empty_pipeline_is_identity() {
        assert_eq!(PluginPipeline::new().run("a red cube"), "a red cube");
    }
}
