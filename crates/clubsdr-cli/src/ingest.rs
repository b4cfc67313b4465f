//! Knowledge ingestion: split `.txt` files into overlapping chunks, embed
//! them and insert them into the knowledge table. The same chunks back the
//! local keyword retriever used when Supabase is not configured.

use anyhow::Context as _;
use async_trait::async_trait;
use clubsdr_agent::{Passage, Retriever};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use crate::supabase::{Embedder, KNOWLEDGE_TABLE, KnowledgeRow, SupabaseClient};

/// Target chunk length in characters
pub const CHUNK_SIZE: usize = 600;
/// Characters shared between consecutive chunks
pub const CHUNK_OVERLAP: usize = 100;
/// Split points, tried in order
pub const SEPARATORS: &[&str] = &["\n===", "\n\n", "\n", " "];

/// Chunks embedded per request
const EMBED_BATCH: usize = 64;

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Recursively split `text` on the first separator present, merging the
/// pieces back into chunks of at most `chunk_size` characters that overlap
/// by up to `overlap` characters. A piece with no separator left that is
/// still too long is kept whole.
pub fn split_text(
    text: &str,
    chunk_size: usize,
    overlap: usize,
    separators: &[&str],
) -> Vec<String> {
    let (separator, rest) = match separators.iter().position(|s| text.contains(s)) {
        Some(i) => (separators[i], &separators[i + 1..]),
        None => (separators.last().copied().unwrap_or(" "), &separators[separators.len()..]),
    };

    let mut chunks = Vec::new();
    let mut pending: Vec<&str> = Vec::new();
    for piece in split_keeping_separator(text, separator) {
        if char_len(piece) < chunk_size {
            pending.push(piece);
            continue;
        }
        if !pending.is_empty() {
            chunks.extend(merge_pieces(&pending, chunk_size, overlap));
            pending.clear();
        }
        if rest.is_empty() {
            chunks.push(piece.trim().to_string());
        } else {
            chunks.extend(split_text(piece, chunk_size, overlap, rest));
        }
    }
    if !pending.is_empty() {
        chunks.extend(merge_pieces(&pending, chunk_size, overlap));
    }
    chunks.retain(|c| !c.is_empty());
    chunks
}

/// Split on `separator`, attaching it to the start of the following piece
fn split_keeping_separator<'a>(text: &'a str, separator: &str) -> Vec<&'a str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    for (index, _) in text.match_indices(separator) {
        if index > start {
            pieces.push(&text[start..index]);
        }
        start = index;
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces.retain(|p| !p.is_empty());
    pieces
}

fn merge_pieces(pieces: &[&str], chunk_size: usize, overlap: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut window: VecDeque<&str> = VecDeque::new();
    let mut total = 0;

    for piece in pieces {
        let len = char_len(piece);
        if total + len > chunk_size && !window.is_empty() {
            let chunk: String = window.iter().copied().collect();
            let chunk = chunk.trim();
            if !chunk.is_empty() {
                chunks.push(chunk.to_string());
            }
            while total > overlap || (total + len > chunk_size && total > 0) {
                match window.pop_front() {
                    Some(front) => total -= char_len(front),
                    None => break,
                }
            }
        }
        window.push_back(piece);
        total += len;
    }

    let chunk: String = window.iter().copied().collect();
    let chunk = chunk.trim();
    if !chunk.is_empty() {
        chunks.push(chunk.to_string());
    }
    chunks
}

/// Category recorded for a file: its name without the `.txt` extension
pub fn category_for(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// `.txt` files directly under `dir`, sorted
pub fn text_files(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let pattern = dir.join("*.txt");
    let pattern = pattern.to_string_lossy();
    let mut files: Vec<PathBuf> = glob::glob(&pattern)
        .with_context(|| format!("Invalid path {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .collect();
    files.sort();
    Ok(files)
}

/// Chunk one file with the default splitter settings
pub fn chunk_file(path: &Path) -> anyhow::Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(split_text(&text, CHUNK_SIZE, CHUNK_OVERLAP, SEPARATORS))
}

/// Embed and insert every `.txt` file under `dir`; returns rows inserted
pub async fn ingest_dir(
    dir: &Path,
    supabase: &SupabaseClient,
    embedder: &Embedder,
    source_url: &str,
) -> anyhow::Result<usize> {
    let files = text_files(dir)?;
    if files.is_empty() {
        tracing::warn!(dir = %dir.display(), "No .txt files found");
        return Ok(0);
    }

    let mut inserted = 0;
    for path in files {
        let chunks = chunk_file(&path)?;
        if chunks.is_empty() {
            tracing::warn!(file = %path.display(), "No chunks produced");
            continue;
        }

        let category = category_for(&path);
        let mut rows = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(EMBED_BATCH) {
            let embeddings = embedder
                .embed(batch)
                .await
                .with_context(|| format!("Failed to embed {}", path.display()))?;
            rows.extend(batch.iter().zip(embeddings).map(|(chunk, embedding)| KnowledgeRow {
                categoria: category.clone(),
                conteudo: chunk.clone(),
                embedding,
                fonte_url: source_url.to_string(),
            }));
        }

        supabase
            .insert(KNOWLEDGE_TABLE, &rows)
            .await
            .with_context(|| format!("Failed to insert rows for {}", path.display()))?;
        tracing::info!(file = %path.display(), rows = rows.len(), "Ingested file");
        inserted += rows.len();
    }
    Ok(inserted)
}

/// Keyword search over chunks held in memory
#[derive(Debug, Default)]
pub struct LocalRetriever {
    chunks: Vec<String>,
    limit: usize,
}

impl LocalRetriever {
    pub fn new(chunks: Vec<String>, limit: usize) -> Self {
        Self { chunks, limit }
    }

    /// Chunk every `.txt` file under `dir`
    pub fn from_dir(dir: &Path, limit: usize) -> anyhow::Result<Self> {
        let mut chunks = Vec::new();
        for path in text_files(dir)? {
            chunks.extend(chunk_file(&path)?);
        }
        tracing::info!(dir = %dir.display(), chunks = chunks.len(), "Loaded local knowledge");
        Ok(Self::new(chunks, limit))
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Chunks ranked by how many query words (3+ chars) they contain
    pub fn matching(&self, query: &str) -> Vec<Passage> {
        let words: Vec<String> = query
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.chars().count() >= 3)
            .map(str::to_string)
            .collect();
        if words.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(usize, &String)> = self
            .chunks
            .iter()
            .map(|chunk| {
                let haystack = chunk.to_lowercase();
                (words.iter().filter(|w| haystack.contains(w.as_str())).count(), chunk)
            })
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored
            .into_iter()
            .take(self.limit)
            .map(|(_, chunk)| Passage::new(chunk.clone()))
            .collect()
    }
}

#[async_trait]
impl Retriever for LocalRetriever {
    async fn search(&self, query: &str) -> clubsdr_agent::Result<Vec<Passage>> {
        Ok(self.matching(query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_is_one_chunk() {
        let text = "  Plano Ouro custa R$ 89,90.  ";
        let chunks = split_text(text, CHUNK_SIZE, CHUNK_OVERLAP, SEPARATORS);
        assert_eq!(chunks, vec!["Plano Ouro custa R$ 89,90."]);
    }

    #[test]
    fn test_empty_text_has_no_chunks() {
        assert!(split_text("\n\n  \n", CHUNK_SIZE, CHUNK_OVERLAP, SEPARATORS).is_empty());
    }

    #[test]
    fn test_sections_split_on_heading_marker() {
        let first = format!("=== PLANOS\n{}", "Sócio Ouro tem muitos benefícios. ".repeat(10));
        let second = format!(
            "\n=== INGRESSOS\n{}",
            "Ingressos à venda na bilheteria. ".repeat(10)
        );
        let text = format!("{}{}", first, second);

        let chunks = split_text(&text, 400, 50, SEPARATORS);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].starts_with("=== PLANOS"));
        assert!(chunks[1].starts_with("=== INGRESSOS"));
    }

    #[test]
    fn test_long_text_respects_size_and_overlaps() {
        let text = (0..200).map(|i| format!("palavra{}", i)).collect::<Vec<_>>().join(" ");
        let chunks = split_text(&text, 100, 30, SEPARATORS);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 100, "chunk too long: {}", chunk);
        }
        for pair in chunks.windows(2) {
            let last_word = pair[0].split(' ').next_back().unwrap();
            assert!(pair[1].contains(last_word), "no overlap between {:?}", pair);
        }
    }

    #[test]
    fn test_unsplittable_piece_is_kept_whole() {
        let word = "x".repeat(50);
        let chunks = split_text(&word, 20, 5, SEPARATORS);
        assert_eq!(chunks, vec![word]);
    }

    #[test]
    fn test_category_from_file_name() {
        assert_eq!(category_for(Path::new("./data/raw/planos.txt")), "planos");
    }

    #[test]
    fn test_local_retriever_ranks_and_limits() {
        let retriever = LocalRetriever::new(
            vec![
                "O estádio fica na Avenida Colombo.".to_string(),
                "O plano Ouro custa R$ 89,90 e inclui ingresso.".to_string(),
                "O plano Prata custa R$ 49,90.".to_string(),
            ],
            1,
        );
        let hits = retriever.matching("quanto custa o plano ouro?");
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("Ouro"));
        assert!(retriever.matching("??").is_empty());
    }

    #[tokio::test]
    async fn test_local_retriever_reads_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("planos.txt"), "Sócio Ouro: R$ 89,90 por mês.").unwrap();
        std::fs::write(dir.path().join("notas.md"), "ignored").unwrap();

        let retriever = LocalRetriever::from_dir(dir.path(), 3).unwrap();
        assert_eq!(retriever.len(), 1);
        let passages = retriever.search("sócio ouro").await.unwrap();
        assert_eq!(passages[0].content, "Sócio Ouro: R$ 89,90 por mês.");
    }
}
