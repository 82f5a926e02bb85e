//! AST-driven chunking (spec §4.2): splits one Markdown file into an ordered
//! sequence of `Chunk`s at a configured heading level, refining oversize segments
//! and merging undersize ones that share an origin.

use pulldown_cmark::{Event, HeadingLevel, Options, Parser, Tag, TagEnd};
use std::collections::{BTreeMap, HashMap};

use crate::config::{ChunkBy, ChunkingStrategy};
use crate::errors::Result;
use crate::types::Chunk;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Heading(u8),
    Other,
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    start: usize,
    end: usize,
    text: String,
}

/// Flattens the event stream into top-level block nodes (depth-0 start/end pairs),
/// each carrying its byte range and a plain-text rendering of its contents.
fn parse_top_level_nodes(markdown: &str, offset_base: usize) -> Vec<Node> {
    let parser = Parser::new_ext(markdown, Options::all()).into_offset_iter();
    let mut nodes = Vec::new();
    let mut depth: i32 = 0;
    let mut cur_start = 0usize;
    let mut cur_kind = NodeKind::Other;
    let mut cur_text = String::new();

    for (event, range) in parser {
        match &event {
            Event::Start(tag) => {
                if depth == 0 {
                    cur_start = range.start;
                    cur_text.clear();
                    cur_kind = match tag {
                        Tag::Heading { level, .. } => NodeKind::Heading(heading_level_u8(*level)),
                        _ => NodeKind::Other,
                    };
                }
                depth += 1;
            }
            Event::End(_) => {
                depth -= 1;
                if depth == 0 {
                    nodes.push(Node {
                        kind: cur_kind,
                        start: offset_base + cur_start,
                        end: offset_base + range.end,
                        text: cur_text.trim().to_string(),
                    });
                }
            }
            Event::Text(t) | Event::Code(t) => {
                if depth >= 1 {
                    cur_text.push_str(t);
                }
            }
            Event::SoftBreak | Event::HardBreak => {
                if depth >= 1 {
                    cur_text.push(' ');
                }
            }
            _ => {}
        }
    }
    nodes
}

fn heading_level_u8(level: HeadingLevel) -> u8 {
    match level {
        HeadingLevel::H1 => 1,
        HeadingLevel::H2 => 2,
        HeadingLevel::H3 => 3,
        HeadingLevel::H4 => 4,
        HeadingLevel::H5 => 5,
        HeadingLevel::H6 => 6,
    }
}

/// `lowercase; non-[a-z0-9 -] stripped; whitespace runs -> "-"; "-" runs collapsed; trim`
fn slugify(text: &str) -> String {
    let lower = text.to_lowercase();
    let filtered: String = lower
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == ' ' || c == '-' { c } else { ' ' })
        .collect();
    let mut slug = String::new();
    let mut last_dash = false;
    for c in filtered.chars() {
        if c == ' ' || c == '-' {
            if !last_dash && !slug.is_empty() {
                slug.push('-');
                last_dash = true;
            }
        } else {
            slug.push(c);
            last_dash = false;
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "section".to_string()
    } else {
        slug
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentKind {
    File,
    Preamble,
    Heading,
}

#[derive(Debug, Clone)]
struct Segment {
    kind: SegmentKind,
    heading: String,
    heading_level: u8,
    ancestor_texts: Vec<String>,
    ancestor_slugs: Vec<String>,
    slug: String,
    nodes: Vec<Node>,
}

impl Segment {
    fn raw_len(&self, source: &str) -> usize {
        match (self.nodes.first(), self.nodes.last()) {
            (Some(first), Some(last)) => source[first.start..last.end].chars().count(),
            _ => 0,
        }
    }

    fn origin_key(&self) -> (u8, u8, String, Vec<String>) {
        let kind_tag = match self.kind {
            SegmentKind::File => 0,
            SegmentKind::Preamble => 1,
            SegmentKind::Heading => 2,
        };
        (kind_tag, self.heading_level, self.slug.clone(), self.ancestor_slugs.clone())
    }
}

/// Splits `nodes` into segments at `level`, tracking ancestor headings shallower than
/// `level` so slugs/breadcrumbs nest correctly. `slug_counts` dedupes siblings sharing
/// a parent path (spec §4.2 "deduplicate within its parent path").
fn split_at_level(
    nodes: &[Node],
    level: u8,
    base_ancestor_texts: &[String],
    base_ancestor_slugs: &[String],
    slug_counts: &mut HashMap<Vec<String>, HashMap<String, u32>>,
) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut ancestor_texts = base_ancestor_texts.to_vec();
    let mut ancestor_slugs = base_ancestor_slugs.to_vec();
    // Stack of (level, text, slug) for headings shallower than the split level.
    let mut stack: Vec<(u8, String, String)> = Vec::new();

    let mut preamble_nodes: Vec<Node> = Vec::new();
    let mut current: Option<Segment> = None;

    for node in nodes {
        if let NodeKind::Heading(h) = node.kind {
            if h < level {
                while stack.last().map(|(l, ..)| *l >= h).unwrap_or(false) {
                    stack.pop();
                }
                stack.push((h, node.text.clone(), slugify(&node.text)));
                ancestor_texts = base_ancestor_texts
                    .iter()
                    .cloned()
                    .chain(stack.iter().map(|(_, t, _)| t.clone()))
                    .collect();
                ancestor_slugs = base_ancestor_slugs
                    .iter()
                    .cloned()
                    .chain(stack.iter().map(|(_, _, s)| s.clone()))
                    .collect();
                if let Some(seg) = current.as_mut() {
                    seg.nodes.push(node.clone());
                } else {
                    preamble_nodes.push(node.clone());
                }
                continue;
            }
            if h == level {
                if let Some(seg) = current.take() {
                    segments.push(seg);
                } else if !preamble_nodes.is_empty() {
                    segments.push(Segment {
                        kind: SegmentKind::Preamble,
                        heading: String::new(),
                        heading_level: 0,
                        ancestor_texts: base_ancestor_texts.to_vec(),
                        ancestor_slugs: base_ancestor_slugs.to_vec(),
                        slug: String::new(),
                        nodes: std::mem::take(&mut preamble_nodes),
                    });
                }
                let path = ancestor_slugs.clone();
                let mut own_slug = slugify(&node.text);
                let counts = slug_counts.entry(path.clone()).or_default();
                let count = counts.entry(own_slug.clone()).or_insert(0);
                *count += 1;
                if *count > 1 {
                    own_slug = format!("{own_slug}-{count}");
                }
                current = Some(Segment {
                    kind: SegmentKind::Heading,
                    heading: node.text.clone(),
                    heading_level: level,
                    ancestor_texts: ancestor_texts.clone(),
                    ancestor_slugs: ancestor_slugs.clone(),
                    slug: own_slug,
                    nodes: vec![node.clone()],
                });
                continue;
            }
        }
        if let Some(seg) = current.as_mut() {
            seg.nodes.push(node.clone());
        } else {
            preamble_nodes.push(node.clone());
        }
    }

    if let Some(seg) = current.take() {
        segments.push(seg);
    } else if !preamble_nodes.is_empty() {
        segments.push(Segment {
            kind: SegmentKind::Preamble,
            heading: String::new(),
            heading_level: 0,
            ancestor_texts: base_ancestor_texts.to_vec(),
            ancestor_slugs: base_ancestor_slugs.to_vec(),
            slug: String::new(),
            nodes: preamble_nodes,
        });
    }

    segments
}

/// Finds the first heading level > `from_level` (up to 6) present among `nodes`.
fn next_available_level(nodes: &[Node], from_level: u8) -> Option<u8> {
    (from_level + 1..=6).find(|&candidate| {
        nodes
            .iter()
            .any(|n| matches!(n.kind, NodeKind::Heading(h) if h == candidate))
    })
}

/// Greedily packs nodes into groups whose raw markdown span stays `<= max` chars.
/// A single node exceeding `max` alone forms its own unmolested group.
fn pack_nodes(nodes: &[Node], source: &str, max: usize) -> Vec<Vec<Node>> {
    let mut groups: Vec<Vec<Node>> = Vec::new();
    let mut current: Vec<Node> = Vec::new();
    let mut current_start: Option<usize> = None;

    for node in nodes {
        let candidate_start = current_start.unwrap_or(node.start);
        let candidate_len = source[candidate_start..node.end].chars().count();
        if !current.is_empty() && candidate_len > max {
            groups.push(std::mem::take(&mut current));
            current_start = Some(node.start);
        } else if current_start.is_none() {
            current_start = Some(node.start);
        }
        current.push(node.clone());
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

/// Phase 1 (spec §4.2): recursively splits any oversize segment by refining at the
/// next available heading level, or bumping the virtual level until one is found,
/// falling back to greedy node packing at depth 6.
fn refine_oversize(
    segment: Segment,
    source: &str,
    strategy: &ChunkingStrategy,
    slug_counts: &mut HashMap<Vec<String>, HashMap<String, u32>>,
) -> Vec<Segment> {
    let max = strategy.max();
    if segment.raw_len(source) <= max {
        return vec![segment];
    }

    let search_from = segment.heading_level.max(1);

    if segment.kind == SegmentKind::Heading {
        // segment.nodes[0] is the segment's own heading node; split_at_level treats it
        // as an ancestor (h < next_level) and always folds it into the leading
        // preamble_nodes group, so the first emitted segment is always a Preamble
        // carrying exactly this segment's own heading plus any body before the first
        // sub-heading. Re-tag that segment with the parent's identity (spec §4.2
        // "preamble-of-refinement, keeping the parent heading") instead of letting it
        // surface as an anonymous `_preamble`.
        if let Some(next_level) = next_available_level(&segment.nodes, search_from) {
            let mut sub_segments = split_at_level(
                &segment.nodes,
                next_level,
                &segment.ancestor_texts,
                &segment.ancestor_slugs,
                slug_counts,
            );
            if let Some(first) = sub_segments.first_mut() {
                if first.kind == SegmentKind::Preamble {
                    first.kind = SegmentKind::Heading;
                    first.heading = segment.heading.clone();
                    first.heading_level = segment.heading_level;
                    first.slug = segment.slug.clone();
                    first.ancestor_texts = segment.ancestor_texts.clone();
                    first.ancestor_slugs = segment.ancestor_slugs.clone();
                }
            }
            return sub_segments
                .into_iter()
                .flat_map(|s| refine_oversize(s, source, strategy, slug_counts))
                .collect();
        }
    } else if let Some(next_level) = next_available_level(&segment.nodes, search_from) {
        let sub_segments = split_at_level(
            &segment.nodes,
            next_level,
            &segment.ancestor_texts,
            &segment.ancestor_slugs,
            slug_counts,
        );
        return sub_segments
            .into_iter()
            .flat_map(|s| refine_oversize(s, source, strategy, slug_counts))
            .collect();
    }

    // No sub-heading anywhere up to H6: pack nodes greedily, preserving this
    // segment's identity (kind/slug/heading) across parts.
    pack_nodes(&segment.nodes, source, max)
        .into_iter()
        .map(|nodes| Segment { nodes, ..segment.clone() })
        .collect()
}

/// Phase 2 (spec §4.2): merges a segment into its predecessor when it's undersize
/// and shares the same origin (i.e. the two are packing-parts of one section).
fn merge_undersize(segments: Vec<Segment>, source: &str, strategy: &ChunkingStrategy) -> Vec<Segment> {
    let Some(min) = strategy.min() else {
        return segments;
    };
    let mut out: Vec<Segment> = Vec::new();
    for seg in segments {
        if seg.raw_len(source) < min {
            if let Some(prev) = out.last_mut() {
                if prev.origin_key() == seg.origin_key() {
                    prev.nodes.extend(seg.nodes);
                    continue;
                }
            }
        }
        out.push(seg);
    }
    out
}

fn chunk_id_for(filepath: &str, segment: &Segment, part: Option<u32>, total_parts: usize) -> String {
    let part_num = part.unwrap_or(1);
    // Part 1 keeps the bare id; only part 2+ gets a `-part-N` suffix (spec §4.2).
    let suffix = if total_parts > 1 && part_num > 1 {
        format!("-part-{part_num}")
    } else {
        String::new()
    };
    match segment.kind {
        SegmentKind::File => {
            if suffix.is_empty() {
                filepath.to_string()
            } else {
                format!("{filepath}#_part-{part_num}")
            }
        }
        SegmentKind::Preamble => format!("{filepath}#_preamble{suffix}"),
        SegmentKind::Heading => {
            let mut path = segment.ancestor_slugs.clone();
            path.push(segment.slug.clone());
            format!("{filepath}#{}{suffix}", path.join("/"))
        }
    }
}

fn breadcrumb_for(filepath: &str, segment: &Segment) -> String {
    let mut parts = vec![filepath.to_string()];
    parts.extend(segment.ancestor_texts.iter().cloned().filter(|t| !t.is_empty()));
    if !segment.heading.is_empty() {
        parts.push(segment.heading.clone());
    }
    parts.join(" \u{25b8} ")
}

fn render_content(segment: &Segment, source: &str) -> (String, String) {
    let content = match (segment.nodes.first(), segment.nodes.last()) {
        (Some(first), Some(last)) => source[first.start..last.end].to_string(),
        _ => String::new(),
    };
    let content_text = segment
        .nodes
        .iter()
        .map(|n| n.text.as_str())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
    (content, content_text)
}

/// Deterministically splits one file's Markdown into an ordered sequence of chunks.
pub fn build_chunks(
    filepath: &str,
    markdown: &str,
    strategy: &ChunkingStrategy,
    metadata: &BTreeMap<String, String>,
) -> Result<Vec<Chunk>> {
    let nodes = parse_top_level_nodes(markdown, 0);
    if nodes.is_empty() {
        return Ok(Vec::new());
    }

    let mut slug_counts: HashMap<Vec<String>, HashMap<String, u32>> = HashMap::new();

    let raw_segments = match strategy.chunk_by {
        ChunkBy::File => vec![Segment {
            kind: SegmentKind::File,
            heading: String::new(),
            heading_level: 0,
            ancestor_texts: Vec::new(),
            ancestor_slugs: Vec::new(),
            slug: String::new(),
            nodes,
        }],
        ChunkBy::H1 | ChunkBy::H2 | ChunkBy::H3 => {
            let level = strategy.chunk_by.heading_level().unwrap_or(2);
            split_at_level(&nodes, level, &[], &[], &mut slug_counts)
        }
    };

    let refined: Vec<Segment> = raw_segments
        .into_iter()
        .flat_map(|s| refine_oversize(s, markdown, strategy, &mut slug_counts))
        .collect();

    let merged = merge_undersize(refined, markdown, strategy);

    // Group consecutive segments sharing an origin to number `-part-N` suffixes.
    let mut chunks = Vec::with_capacity(merged.len());
    let mut i = 0usize;
    let mut chunk_index = 0usize;
    while i < merged.len() {
        let key = merged[i].origin_key();
        let mut j = i + 1;
        while j < merged.len() && merged[j].origin_key() == key {
            j += 1;
        }
        let group = &merged[i..j];
        let total_parts = group.len();
        for (part_idx, segment) in group.iter().enumerate() {
            let (content, content_text) = render_content(segment, markdown);
            let chunk_id = chunk_id_for(filepath, segment, Some(part_idx as u32 + 1), total_parts);
            let breadcrumb = breadcrumb_for(filepath, segment);
            chunks.push(Chunk {
                chunk_id,
                filepath: filepath.to_string(),
                heading: segment.heading.clone(),
                heading_level: segment.heading_level,
                content,
                content_text,
                breadcrumb,
                chunk_index,
                metadata: metadata.clone(),
            });
            chunk_index += 1;
        }
        i = j;
    }

    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChunkBy;

    fn strategy(chunk_by: ChunkBy, max: Option<usize>, min: Option<usize>) -> ChunkingStrategy {
        ChunkingStrategy {
            chunk_by,
            max_chunk_size: max,
            min_chunk_size: min,
        }
    }

    #[test]
    fn splits_on_h2_boundaries() {
        let md = "# Title\nintro text\n\n## First\nbody one\n\n## Second\nbody two\n";
        let chunks = build_chunks("guide.md", md, &strategy(ChunkBy::H2, None, None), &BTreeMap::new()).unwrap();
        assert_eq!(chunks.len(), 3, "preamble + two h2 sections");
        assert_eq!(chunks[0].chunk_id, "guide.md#_preamble");
        assert_eq!(chunks[1].chunk_id, "guide.md#first");
        assert_eq!(chunks[2].chunk_id, "guide.md#second");
        assert!(chunks[1].breadcrumb.contains("First"));
    }

    #[test]
    fn duplicate_sibling_slugs_are_disambiguated() {
        let md = "## Setup\nstep one\n\n## Setup\nstep two\n";
        let chunks = build_chunks("readme.md", md, &strategy(ChunkBy::H2, None, None), &BTreeMap::new()).unwrap();
        assert_eq!(chunks[0].chunk_id, "readme.md#setup");
        assert_eq!(chunks[1].chunk_id, "readme.md#setup-2");
    }

    #[test]
    fn file_strategy_yields_single_chunk() {
        let md = "# Title\n\n## A\nbody\n\n## B\nbody\n";
        let chunks = build_chunks("all.md", md, &strategy(ChunkBy::File, None, None), &BTreeMap::new()).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_id, "all.md");
    }

    #[test]
    fn oversize_section_is_packed_into_parts() {
        let big_para = "x".repeat(40);
        let md = format!(
            "## Section\n{}\n\n{}\n\n{}\n",
            big_para, big_para, big_para
        );
        let chunks = build_chunks(
            "big.md",
            &md,
            &strategy(ChunkBy::H2, Some(60), None),
            &BTreeMap::new(),
        )
        .unwrap();
        assert!(chunks.len() > 1, "oversize section should split into parts");
        assert_eq!(chunks[0].chunk_id, "big.md#section", "part 1 keeps the bare section id");
        assert_eq!(chunks[1].chunk_id, "big.md#section-part-2");
    }

    #[test]
    fn recursive_refinement_keeps_parent_heading_identity() {
        let body = "x".repeat(50);
        let md = format!(
            "## Authentication\n\n### OAuth\n{body}\n\n### JWT\n{body}\n\n### API Keys\n{body}\n"
        );
        let chunks = build_chunks(
            "guide.md",
            &md,
            &strategy(ChunkBy::H2, Some(100), None),
            &BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].chunk_id, "guide.md#authentication");
        assert_eq!(chunks[1].chunk_id, "guide.md#authentication/oauth");
        assert_eq!(chunks[2].chunk_id, "guide.md#authentication/jwt");
        assert_eq!(chunks[3].chunk_id, "guide.md#authentication/api-keys");
        assert_eq!(chunks[1].heading_level, 3);
        assert!(chunks[1].breadcrumb.ends_with("Authentication \u{25b8} OAuth"));
    }

    #[test]
    fn independently_refined_sections_do_not_collide_on_preamble_id() {
        let body = "x".repeat(50);
        let md = format!(
            "## Setup\n\n### Step One\n{body}\n\n### Step Two\n{body}\n\n## Teardown\n\n### Step One\n{body}\n\n### Step Two\n{body}\n"
        );
        let chunks = build_chunks(
            "guide.md",
            &md,
            &strategy(ChunkBy::H2, Some(100), None),
            &BTreeMap::new(),
        )
        .unwrap();
        let ids: Vec<&str> = chunks.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec![
            "guide.md#setup",
            "guide.md#setup/step-one",
            "guide.md#setup/step-two",
            "guide.md#teardown",
            "guide.md#teardown/step-one",
            "guide.md#teardown/step-two",
        ]);
    }

    #[test]
    fn undersize_parts_of_same_section_are_merged() {
        let md = "## Section\na\n\nb\n\nc\n";
        let chunks = build_chunks(
            "small.md",
            md,
            &strategy(ChunkBy::H2, Some(10_000), Some(5)),
            &BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(chunks.len(), 1, "tiny fragments of one section stay merged");
    }
}
