use crate::index::{ChunkRecord, Namespace, ScoredChunk, VectorIndex};
use async_trait::async_trait;
use pdfchat_error::{PdfChatError, Result};
use qdrant_client::{
    qdrant::{
        condition::ConditionOneOf, points_selector::PointsSelectorOneOf, r#match::MatchValue,
        value::Kind, vectors_config::Config, with_payload_selector::SelectorOptions, Condition,
        CountPoints, CreateCollection, DeletePoints, Distance, FieldCondition, Filter, Match,
        PointStruct, PointsSelector, SearchPoints, UpsertPoints, Value, VectorParams,
        VectorsConfig, WithPayloadSelector,
    },
    Qdrant,
};
use std::collections::HashMap;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const OWNER_KEY: &str = "owner";
const NAMESPACE_KEY: &str = "namespace";
const CHUNK_INDEX_KEY: &str = "chunk_index";
const TEXT_KEY: &str = "text";

/// Vector index on a single Qdrant collection; namespaces are payload filters.
pub struct QdrantVectorIndex {
    client: Qdrant,
    collection_name: String,
    vector_size: usize,
}

impl QdrantVectorIndex {
    pub async fn connect(url: &str, collection_name: &str, vector_size: usize) -> Result<Self> {
        let client = Qdrant::from_url(url)
            .build()
            .map_err(|e| PdfChatError::VectorStore {
                operation: "connect".to_string(),
                message: format!("Failed to connect to Qdrant: {}", e),
            })?;

        let index = Self {
            client,
            collection_name: collection_name.to_string(),
            vector_size,
        };
        index.ensure_collection().await?;
        Ok(index)
    }

    async fn ensure_collection(&self) -> Result<()> {
        match self
            .client
            .collection_exists(self.collection_name.clone())
            .await
        {
            Ok(true) => Ok(()),
            Ok(false) => self.create_collection().await,
            Err(e) => {
                warn!("Failed to check collection existence: {}", e);
                self.create_collection().await
            }
        }
    }

    async fn create_collection(&self) -> Result<()> {
        let vectors_config = VectorsConfig {
            config: Some(Config::Params(VectorParams {
                size: self.vector_size as u64,
                distance: Distance::Cosine.into(),
                ..Default::default()
            })),
        };

        let create_collection = CreateCollection {
            collection_name: self.collection_name.clone(),
            vectors_config: Some(vectors_config),
            ..Default::default()
        };

        self.client
            .create_collection(create_collection)
            .await
            .map_err(|e| PdfChatError::VectorStore {
                operation: "create_collection".to_string(),
                message: format!(
                    "Failed to create collection {}: {}",
                    self.collection_name, e
                ),
            })?;

        info!(
            collection = %self.collection_name,
            vector_size = self.vector_size,
            "Created Qdrant collection"
        );
        Ok(())
    }

    fn check_dimension(&self, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.vector_size {
            return Err(PdfChatError::VectorStore {
                operation: "dimension_check".to_string(),
                message: format!(
                    "embedding has {} dimensions, collection {} expects {}",
                    embedding.len(),
                    self.collection_name,
                    self.vector_size
                ),
            });
        }
        Ok(())
    }
}

fn keyword(key: &str, value: &str) -> Condition {
    Condition {
        condition_one_of: Some(ConditionOneOf::Field(FieldCondition {
            key: key.to_string(),
            r#match: Some(Match {
                match_value: Some(MatchValue::Keyword(value.to_string())),
            }),
            ..Default::default()
        })),
    }
}

fn namespace_filter(ns: &Namespace) -> Filter {
    Filter {
        must: vec![
            keyword(OWNER_KEY, &ns.owner_id),
            keyword(NAMESPACE_KEY, &ns.document_id),
        ],
        ..Default::default()
    }
}

fn string_value(s: &str) -> Value {
    Value {
        kind: Some(Kind::StringValue(s.to_string())),
    }
}

fn chunk_payload(ns: &Namespace, chunk_index: u32, text: &str) -> HashMap<String, Value> {
    let mut payload = HashMap::new();
    payload.insert(OWNER_KEY.to_string(), string_value(&ns.owner_id));
    payload.insert(NAMESPACE_KEY.to_string(), string_value(&ns.document_id));
    payload.insert(
        CHUNK_INDEX_KEY.to_string(),
        Value {
            kind: Some(Kind::IntegerValue(chunk_index as i64)),
        },
    );
    payload.insert(TEXT_KEY.to_string(), string_value(text));
    payload
}

fn chunk_from_payload(payload: &HashMap<String, Value>, score: f32) -> Option<ScoredChunk> {
    let text = match payload.get(TEXT_KEY).and_then(|v| v.kind.as_ref()) {
        Some(Kind::StringValue(s)) => s.clone(),
        _ => return None,
    };
    let chunk_index = match payload.get(CHUNK_INDEX_KEY).and_then(|v| v.kind.as_ref()) {
        Some(Kind::IntegerValue(i)) => *i as u32,
        Some(Kind::DoubleValue(f)) => *f as u32,
        _ => 0,
    };
    Some(ScoredChunk {
        chunk_index,
        text,
        score,
    })
}

#[async_trait]
impl VectorIndex for QdrantVectorIndex {
    async fn chunk_count(&self, ns: &Namespace) -> Result<usize> {
        let request = CountPoints {
            collection_name: self.collection_name.clone(),
            filter: Some(namespace_filter(ns)),
            exact: Some(true),
            ..Default::default()
        };
        let response = self
            .client
            .count(request)
            .await
            .map_err(|e| PdfChatError::VectorStore {
                operation: "count".to_string(),
                message: format!("Failed to count points for {}: {}", ns, e),
            })?;
        Ok(response.result.map(|r| r.count as usize).unwrap_or(0))
    }

    #[instrument(skip(self, records), fields(namespace = %ns, chunks = records.len()))]
    async fn upsert(&self, ns: &Namespace, records: Vec<ChunkRecord>) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut points = Vec::with_capacity(records.len());
        for record in records {
            self.check_dimension(&record.embedding)?;
            points.push(PointStruct {
                id: Some(Uuid::new_v4().to_string().into()),
                vectors: Some(record.embedding.into()),
                payload: chunk_payload(ns, record.chunk_index, &record.text),
            });
        }
        let count = points.len();

        let upsert_request = UpsertPoints {
            collection_name: self.collection_name.clone(),
            wait: Some(true),
            points,
            ..Default::default()
        };

        self.client
            .upsert_points(upsert_request)
            .await
            .map_err(|e| PdfChatError::VectorStore {
                operation: "upsert_points".to_string(),
                message: format!("Failed to upsert points: {}", e),
            })?;

        info!(namespace = %ns, chunks_added = count, "Added chunks to Qdrant");
        Ok(count)
    }

    #[instrument(skip(self, query), fields(namespace = %ns))]
    async fn search(
        &self,
        ns: &Namespace,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>> {
        self.check_dimension(query)?;
        let search_points = SearchPoints {
            collection_name: self.collection_name.clone(),
            vector: query.to_vec(),
            filter: Some(namespace_filter(ns)),
            limit: top_k as u64,
            with_payload: Some(WithPayloadSelector {
                selector_options: Some(SelectorOptions::Enable(true)),
            }),
            ..Default::default()
        };

        let search_result = self
            .client
            .search_points(search_points)
            .await
            .map_err(|e| PdfChatError::VectorStore {
                operation: "search".to_string(),
                message: format!("Failed to search points: {}", e),
            })?;

        let mut results = Vec::new();
        for point in search_result.result {
            match chunk_from_payload(&point.payload, point.score) {
                Some(chunk) => results.push(chunk),
                None => warn!("Point without text payload in {}. Skipping.", ns),
            }
        }
        Ok(results)
    }

    async fn delete_namespace(&self, ns: &Namespace) -> Result<()> {
        let delete_request = DeletePoints {
            collection_name: self.collection_name.clone(),
            wait: Some(true),
            points: Some(PointsSelector {
                points_selector_one_of: Some(PointsSelectorOneOf::Filter(namespace_filter(ns))),
            }),
            ..Default::default()
        };

        self.client
            .delete_points(delete_request)
            .await
            .map_err(|e| PdfChatError::VectorStore {
                operation: "delete_namespace".to_string(),
                message: format!("Failed to delete namespace {}: {}", ns, e),
            })?;
        info!(namespace = %ns, "Deleted Qdrant namespace");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_round_trip() {
        let ns = Namespace::new("u1", "abc");
        let payload = chunk_payload(&ns, 7, "some text");
        let chunk = chunk_from_payload(&payload, 0.5).unwrap();
        assert_eq!(chunk.chunk_index, 7);
        assert_eq!(chunk.text, "some text");
        assert!(matches!(
            payload.get(OWNER_KEY).and_then(|v| v.kind.as_ref()),
            Some(Kind::StringValue(s)) if s == "u1"
        ));
    }

    #[test]
    fn test_payload_without_text_is_skipped() {
        assert!(chunk_from_payload(&HashMap::new(), 0.1).is_none());
    }

    #[test]
    fn test_namespace_filter_matches_owner_and_document() {
        let filter = namespace_filter(&Namespace::new("u1", "abc"));
        assert_eq!(filter.must.len(), 2);
    }
}
