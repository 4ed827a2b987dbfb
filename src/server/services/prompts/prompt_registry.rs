use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::errors::Error;
use crate::server::context::RequestContext;
use crate::types::{ GetPromptParams, GetPromptResult, ListPromptsResult, Prompt };

/// Renders a prompt from its argument values. Template rendering is up to the
/// handler.
pub type PromptHandler = Arc<
    dyn (Fn(RequestContext, HashMap<String, String>) -> BoxFuture<'static, Result<GetPromptResult, Error>>) +
        Send +
        Sync
>;

struct PromptDefinition {
    prompt: Prompt,
    handler: PromptHandler,
}

/// Registry of prompts in registration order
#[derive(Default)]
pub struct PromptRegistry {
    prompts: RwLock<Vec<PromptDefinition>>,
}

impl PromptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a prompt with its renderer; names are unique within a server
    pub async fn register<F, Fut>(&self, prompt: Prompt, handler: F) -> Result<(), Error>
        where
            F: Fn(RequestContext, HashMap<String, String>) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Result<GetPromptResult, Error>> + Send + 'static
    {
        let handler: PromptHandler = Arc::new(
            move |
                ctx: RequestContext,
                args: HashMap<String, String>
            | -> BoxFuture<'static, Result<GetPromptResult, Error>> {
                Box::pin(handler(ctx, args))
            }
        );
        self.register_handler(prompt, handler).await
    }

    /// Register an already type-erased renderer
    pub async fn register_handler(&self, prompt: Prompt, handler: PromptHandler) -> Result<(), Error> {
        let mut prompts = self.prompts.write().await;
        if prompts.iter().any(|p| p.prompt.name == prompt.name) {
            return Err(Error::Conflict(format!("Prompt already exists: {}", prompt.name)));
        }
        info!(prompt = %prompt.name, "Registered prompt");
        prompts.push(PromptDefinition { prompt, handler });
        Ok(())
    }

    pub async fn is_empty(&self) -> bool {
        self.prompts.read().await.is_empty()
    }

    /// All prompts, for `listPrompts`
    pub async fn list(&self) -> ListPromptsResult {
        let prompts = self.prompts.read().await;
        ListPromptsResult {
            prompts: prompts
                .iter()
                .map(|p| p.prompt.clone())
                .collect(),
        }
    }

    /// Render a prompt, for `getPrompt`. Missing required arguments are
    /// rejected before the renderer runs.
    pub async fn get(&self, ctx: RequestContext, params: GetPromptParams) -> Result<GetPromptResult, Error> {
        let (prompt, handler) = {
            let prompts = self.prompts.read().await;
            let definition = prompts
                .iter()
                .find(|p| p.prompt.name == params.name)
                .ok_or_else(|| Error::NotFound(format!("Prompt not found: {}", params.name)))?;
            (definition.prompt.clone(), definition.handler.clone())
        };

        let missing = prompt.missing_arguments(&params.arguments);
        if !missing.is_empty() {
            return Err(
                Error::InvalidParams(format!("Missing required arguments: {}", missing.join(", ")))
            );
        }

        let mut result = handler(ctx, params.arguments).await?;
        if result.description.is_none() {
            result.description = prompt.description;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ PromptArgument, PromptMessage };

    async fn registry() -> PromptRegistry {
        let registry = PromptRegistry::new();
        registry
            .register(
                Prompt::new("greet")
                    .with_description("Greets someone")
                    .with_argument(PromptArgument::required("name")),
                |_ctx, args| async move {
                    let name = args.get("name").cloned().unwrap_or_default();
                    Ok(GetPromptResult {
                        description: None,
                        messages: vec![PromptMessage::user(format!("Hello, {}!", name))],
                    })
                }
            ).await
            .unwrap();
        registry
    }

    fn params(name: &str, args: &[(&str, &str)]) -> GetPromptParams {
        GetPromptParams {
            name: name.to_string(),
            arguments: args
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[tokio::test]
    async fn renders_with_arguments() {
        let registry = registry().await;
        let result = registry
            .get(RequestContext::detached("getPrompt"), params("greet", &[("name", "Ada")])).await
            .unwrap();
        assert_eq!(result.description.as_deref(), Some("Greets someone"));
        assert_eq!(result.messages, vec![PromptMessage::user("Hello, Ada!")]);
    }

    #[tokio::test]
    async fn missing_required_argument_is_bad_request() {
        let registry = registry().await;
        let err = registry
            .get(RequestContext::detached("getPrompt"), params("greet", &[])).await
            .unwrap_err();
        assert_eq!(err.code(), 400);
        assert_eq!(err.message(), "Missing required arguments: name");
    }

    #[tokio::test]
    async fn unknown_and_duplicate_prompts() {
        let registry = registry().await;
        let err = registry
            .get(RequestContext::detached("getPrompt"), params("nope", &[])).await
            .unwrap_err();
        assert_eq!(err.code(), 404);

        let dup = registry.register(Prompt::new("greet"), |_ctx, _args| async move {
            Ok(GetPromptResult { description: None, messages: vec![] })
        }).await;
        assert_eq!(dup.unwrap_err().code(), 409);
    }
}
