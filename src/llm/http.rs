//! HTTP client for a remote LLM refinement/answer service.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    AnswerEvidence, AnswerGenerator, GeneratedAnswer, ProviderError, QueryRefiner, RefinedQuery,
    SchemaContext,
};

/// HTTP provider speaking a small JSON protocol: POST /v1/refine and
/// POST /v1/answer.
pub struct HttpLlmProvider {
    base_url: String,
    client: reqwest::Client,
    timeout_secs: u64,
    model: String,
}

impl HttpLlmProvider {
    pub fn new(base_url: &str, model: &str, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            timeout_secs,
            model: model.to_string(),
        }
    }

    /// The model name being used.
    pub fn model(&self) -> &str {
        &self.model
    }

    fn map_send_error(&self, e: reqwest::Error) -> ProviderError {
        if e.is_connect() {
            ProviderError::Connection(self.base_url.clone())
        } else if e.is_timeout() {
            ProviderError::Timeout { seconds: self.timeout_secs }
        } else {
            ProviderError::Connection(e.to_string())
        }
    }

    async fn post_json<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp, ProviderError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http { status: status.as_u16(), body });
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::ResponseParsing(e.to_string()))
    }
}

#[derive(Serialize)]
struct RefineRequest<'a> {
    model: &'a str,
    query: &'a str,
    schema_context: &'a SchemaContext,
}

#[derive(Serialize)]
struct AnswerRequest<'a> {
    model: &'a str,
    query: &'a str,
    evidence: &'a AnswerEvidence,
}

#[async_trait]
impl QueryRefiner for HttpLlmProvider {
    async fn refine_query(
        &self,
        query: &str,
        context: &SchemaContext,
    ) -> Result<RefinedQuery, ProviderError> {
        let body = RefineRequest { model: &self.model, query, schema_context: context };
        self.post_json("/v1/refine", &body).await
    }
}

#[async_trait]
impl AnswerGenerator for HttpLlmProvider {
    async fn generate_answer(
        &self,
        query: &str,
        evidence: &AnswerEvidence,
    ) -> Result<GeneratedAnswer, ProviderError> {
        let body = AnswerRequest { model: &self.model, query, evidence };
        self.post_json("/v1/answer", &body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let provider = HttpLlmProvider::new("http://localhost:8091/", "refine-8b", 30);
        assert_eq!(provider.base_url, "http://localhost:8091");
        assert_eq!(provider.model(), "refine-8b");
    }

    /// Verify the client satisfies both provider traits.
    #[test]
    fn provider_satisfies_traits() {
        fn _accepts_refiner<R: QueryRefiner>(_r: &R) {}
        fn _accepts_answerer<G: AnswerGenerator>(_g: &G) {}

        let _: fn(&HttpLlmProvider) = _accepts_refiner;
        let _: fn(&HttpLlmProvider) = _accepts_answerer;
    }
}
