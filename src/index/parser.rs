//! Tree-sitter extraction of C/C++ definitions

use super::{Definition, DefinitionKind};
use std::cell::RefCell;
use std::path::Path;
use tree_sitter::{Node, Parser, TreeCursor};

// Tree-sitter parsers are expensive to create; each rayon worker keeps one.
thread_local! {
    static CPP_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        // Ignore error here - will be caught at parse time if language fails
        let _ = p.set_language(&tree_sitter_cpp::LANGUAGE.into());
        p
    });
}

/// A leading comment is attached to a definition that starts at most this
/// many lines after the comment ends.
const COMMENT_ATTACH_DISTANCE: usize = 2;

fn parse_with_pooled_parser(content: &str) -> anyhow::Result<tree_sitter::Tree> {
    CPP_PARSER
        .with(|p| p.borrow_mut().parse(content, None))
        .ok_or_else(|| anyhow::anyhow!("Failed to parse file"))
}

struct Span {
    start: usize,
    end: usize,
}

/// Parse one source file and return every named definition it contains.
pub fn extract_definitions(path: &Path, content: &str) -> anyhow::Result<Vec<Definition>> {
    let tree = parse_with_pooled_parser(content)?;
    let mut definitions = Vec::new();
    let mut comments = Vec::new();

    let mut cursor = tree.root_node().walk();
    walk(&mut cursor, &mut |node| {
        if node.kind() == "comment" {
            let (start, end) = line_span(&node);
            comments.push(Span { start, end });
            return;
        }
        let Some(kind) = DefinitionKind::from_node_kind(node.kind()) else {
            return;
        };
        let Some(name) = definition_name(&node, kind, content) else {
            return;
        };
        let (start_line, end_line) = line_span(&node);
        definitions.push(Definition {
            name,
            kind,
            file: path.to_path_buf(),
            start_line,
            end_line,
        });
    });

    attach_leading_comments(&mut definitions, comments);
    Ok(definitions)
}

fn walk<'t>(cursor: &mut TreeCursor<'t>, visit: &mut impl FnMut(Node<'t>)) {
    loop {
        visit(cursor.node());
        if cursor.goto_first_child() {
            walk(cursor, visit);
            cursor.goto_parent();
        }
        if !cursor.goto_next_sibling() {
            break;
        }
    }
}

/// 1-based inclusive line range. Nodes that end at column 0 of the next line
/// (macros swallow their newline) are pulled back one line.
fn line_span(node: &Node) -> (usize, usize) {
    let start = node.start_position().row + 1;
    let mut end = node.end_position().row + 1;
    if node.end_position().column == 0 && end > start {
        end -= 1;
    }
    (start, end)
}

fn attach_leading_comments(definitions: &mut [Definition], mut comments: Vec<Span>) {
    for definition in definitions.iter_mut() {
        let found = comments.iter().position(|c| {
            c.end <= definition.start_line
                && definition.start_line - c.end <= COMMENT_ATTACH_DISTANCE
        });
        if let Some(idx) = found {
            definition.start_line = comments[idx].start;
            comments.remove(idx);
        }
    }
}

fn node_text<'a>(node: &Node, content: &'a str) -> &'a str {
    node.utf8_text(content.as_bytes()).unwrap_or("")
}

fn definition_name(node: &Node, kind: DefinitionKind, content: &str) -> Option<String> {
    match kind {
        DefinitionKind::Macro => node
            .child_by_field_name("name")
            .map(|n| node_text(&n, content).to_string()),
        DefinitionKind::Struct | DefinitionKind::Class => {
            // Only real definitions; `struct foo *p;` is a use, not a definition
            node.child_by_field_name("body")?;
            node.child_by_field_name("name")
                .map(|n| last_segment(node_text(&n, content)))
        }
        DefinitionKind::Function => {
            let declarator = find_function_declarator(node.child_by_field_name("declarator")?)?;
            let name_node = declarator.child_by_field_name("declarator")?;
            let name = last_segment(node_text(&name_node, content));
            (!name.is_empty()).then_some(name)
        }
        DefinitionKind::Typedef => {
            let text = node_text(node, content).trim_end().trim_end_matches(';');
            let name = trailing_identifier(text);
            (!name.is_empty()).then(|| name.to_string())
        }
    }
}

/// Descend through pointer/reference/parenthesized declarators to the
/// `function_declarator` carrying the name.
fn find_function_declarator(node: Node) -> Option<Node> {
    if node.kind() == "function_declarator" {
        return Some(node);
    }
    if let Some(inner) = node.child_by_field_name("declarator") {
        return find_function_declarator(inner);
    }
    let mut cursor = node.walk();
    let children: Vec<Node> = node.named_children(&mut cursor).collect();
    children.into_iter().find_map(find_function_declarator)
}

/// `ns::Type::method` -> `method`; also drops any leading qualifiers.
fn last_segment(text: &str) -> String {
    let tail = text.rsplit("::").next().unwrap_or(text);
    tail.split_whitespace().last().unwrap_or(tail).to_string()
}

fn trailing_identifier(text: &str) -> &str {
    let start = text
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_alphanumeric() || *c == '_')
        .last()
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    &text[start..]
}
