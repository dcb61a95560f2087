use crate::index::{Namespace, ScoredChunk, VectorIndex};
use pdfchat_core::{ChatMessage, Role};
use pdfchat_error::{PdfChatError, Result};
use pdfchat_llm::{ChatModel, EmbedModel, PromptMessage};
use std::sync::Arc;
use tracing::{debug, info, instrument};

pub const DEFAULT_TOP_K: usize = 4;

const REPHRASE_INSTRUCTION: &str = "Given the above conversation, generate a search query to look up in order to get information relevant to the conversation";

/// Result of one question answered against a document.
#[derive(Debug, Clone)]
pub struct ChainOutput {
    pub answer: String,
    pub search_query: String,
    pub sources: Vec<ScoredChunk>,
}

/// History-aware retrieval followed by a stuffed-context answer.
///
/// 1. With prior turns, the chat model rewrites the question into a
///    standalone search query; without them the question is the query.
/// 2. The query is embedded and the closest chunks of the document's
///    namespace are retrieved.
/// 3. The chunks are joined into a system prompt and the model answers
///    the question with the conversation in view.
pub struct ConversationalRetrievalChain {
    chat: Arc<dyn ChatModel>,
    embedder: Arc<dyn EmbedModel>,
    index: Arc<dyn VectorIndex>,
    top_k: usize,
}

impl ConversationalRetrievalChain {
    pub fn new(
        chat: Arc<dyn ChatModel>,
        embedder: Arc<dyn EmbedModel>,
        index: Arc<dyn VectorIndex>,
        top_k: usize,
    ) -> Self {
        Self {
            chat,
            embedder,
            index,
            top_k: top_k.max(1),
        }
    }

    /// `history` is chronological. Placeholder entries are ignored.
    #[instrument(skip(self, history, question), fields(namespace = %ns, history = history.len()))]
    pub async fn run(
        &self,
        ns: &Namespace,
        history: &[ChatMessage],
        question: &str,
    ) -> Result<ChainOutput> {
        let turns = history_prompt(history);

        let search_query = if turns.is_empty() {
            question.to_string()
        } else {
            let rewritten = self.chat.chat(&rephrase_messages(&turns, question)).await?;
            let rewritten = rewritten.trim();
            if rewritten.is_empty() {
                question.to_string()
            } else {
                rewritten.to_string()
            }
        };
        debug!(search_query = %search_query, "retrieval query");

        let embedding = self
            .embedder
            .embed(&[search_query.clone()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| PdfChatError::EmbeddingService {
                provider: "embedder".to_string(),
                message: "no embedding returned for query".to_string(),
                retry_after: None,
            })?;

        let sources = self.index.search(ns, &embedding, self.top_k).await?;
        let context = sources
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let answer = self
            .chat
            .chat(&answer_messages(&context, &turns, question))
            .await?;

        info!(sources = sources.len(), "answered question");
        Ok(ChainOutput {
            answer,
            search_query,
            sources,
        })
    }
}

fn history_prompt(history: &[ChatMessage]) -> Vec<PromptMessage> {
    history
        .iter()
        .filter_map(|m| match m.role {
            Role::Human => Some(PromptMessage::user(m.message.clone())),
            Role::Ai => Some(PromptMessage::assistant(m.message.clone())),
            Role::Placeholder => None,
        })
        .collect()
}

fn rephrase_messages(turns: &[PromptMessage], question: &str) -> Vec<PromptMessage> {
    let mut messages = turns.to_vec();
    messages.push(PromptMessage::user(question));
    messages.push(PromptMessage::user(REPHRASE_INSTRUCTION));
    messages
}

fn answer_messages(context: &str, turns: &[PromptMessage], question: &str) -> Vec<PromptMessage> {
    let mut messages = Vec::with_capacity(turns.len() + 2);
    messages.push(PromptMessage::system(format!(
        "Answer the user's question based on the below context:\n\n{}",
        context
    )));
    messages.extend_from_slice(turns);
    messages.push(PromptMessage::user(question));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::ChunkRecord;
    use crate::memory::MemoryVectorIndex;
    use async_trait::async_trait;
    use pdfchat_llm::PromptRole;
    use std::sync::Mutex;

    /// Replies with queued answers and records every request.
    struct ScriptedChat {
        replies: Mutex<Vec<String>>,
        seen: Mutex<Vec<Vec<PromptMessage>>>,
    }

    impl ScriptedChat {
        fn new(replies: &[&str]) -> Self {
            Self {
                replies: Mutex::new(replies.iter().rev().map(|s| s.to_string()).collect()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedChat {
        async fn chat(&self, messages: &[PromptMessage]) -> Result<String> {
            self.seen.lock().unwrap().push(messages.to_vec());
            Ok(self.replies.lock().unwrap().pop().unwrap_or_default())
        }
    }

    /// Embeds by keyword presence so retrieval is predictable.
    struct KeywordEmbedder;

    #[async_trait]
    impl EmbedModel for KeywordEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let t = t.to_lowercase();
                    vec![
                        t.contains("revenue") as u8 as f32,
                        t.contains("ceo") as u8 as f32,
                        0.1,
                    ]
                })
                .collect())
        }
    }

    async fn setup(replies: &[&str]) -> (ConversationalRetrievalChain, Arc<ScriptedChat>, Namespace) {
        let index = MemoryVectorIndex::new();
        let ns = Namespace::new("u1", "doc");
        let texts = ["Revenue grew 12% in 2023.", "The CEO is Jane Doe."];
        let embeddings = KeywordEmbedder
            .embed(&texts.iter().map(|s| s.to_string()).collect::<Vec<_>>())
            .await
            .unwrap();
        let records = texts
            .iter()
            .zip(embeddings)
            .enumerate()
            .map(|(i, (t, e))| ChunkRecord {
                chunk_index: i as u32,
                text: t.to_string(),
                embedding: e,
            })
            .collect();
        index.upsert(&ns, records).await.unwrap();

        let chat = Arc::new(ScriptedChat::new(replies));
        let chain =
            ConversationalRetrievalChain::new(chat.clone(), Arc::new(KeywordEmbedder), Arc::new(index), 1);
        (chain, chat, ns)
    }

    #[tokio::test]
    async fn test_first_question_skips_rephrasing() {
        let (chain, chat, ns) = setup(&["It grew 12%."]).await;
        let out = chain.run(&ns, &[], "How did revenue change?").await.unwrap();

        assert_eq!(out.answer, "It grew 12%.");
        assert_eq!(out.search_query, "How did revenue change?");
        assert_eq!(out.sources.len(), 1);
        assert_eq!(out.sources[0].chunk_index, 0);

        let seen = chat.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let prompt = &seen[0];
        assert_eq!(prompt[0].role, PromptRole::System);
        assert!(prompt[0].content.contains("Revenue grew 12% in 2023."));
        assert!(prompt[0]
            .content
            .starts_with("Answer the user's question based on the below context:\n\n"));
        assert_eq!(prompt.last().unwrap().content, "How did revenue change?");
    }

    #[tokio::test]
    async fn test_follow_up_uses_rewritten_query() {
        let (chain, chat, ns) = setup(&["  who is the CEO  ", "Jane Doe."]).await;
        let history = vec![
            ChatMessage::human("How did revenue change?"),
            ChatMessage::new(Role::Placeholder, "Thinking..."),
            ChatMessage::ai("It grew 12%."),
        ];
        let out = chain.run(&ns, &history, "And who runs it?").await.unwrap();

        assert_eq!(out.search_query, "who is the CEO");
        assert_eq!(out.sources[0].chunk_index, 1);
        assert_eq!(out.answer, "Jane Doe.");

        let seen = chat.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        let rephrase = &seen[0];
        let roles: Vec<PromptRole> = rephrase.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![PromptRole::User, PromptRole::Assistant, PromptRole::User, PromptRole::User]
        );
        assert_eq!(rephrase[3].content, REPHRASE_INSTRUCTION);
        assert!(rephrase.iter().all(|m| m.content != "Thinking..."));

        let answer = &seen[1];
        assert_eq!(answer.len(), 4);
        assert!(answer[0].content.contains("The CEO is Jane Doe."));
        assert_eq!(answer[3].content, "And who runs it?");
    }

    #[tokio::test]
    async fn test_blank_rewrite_falls_back_to_question() {
        let (chain, _, ns) = setup(&["   ", "ok"]).await;
        let history = vec![ChatMessage::human("hi"), ChatMessage::ai("hello")];
        let out = chain.run(&ns, &history, "revenue?").await.unwrap();
        assert_eq!(out.search_query, "revenue?");
    }
}
