//! Parser for the DOT graph language.
//!
//! Covers what pipeline and dependency diagrams use in practice: `strict`,
//! `graph`/`digraph`, node, edge and attribute statements, `ID = ID`, nested
//! and `cluster*` subgraphs, subgraphs as edge endpoints, ports (parsed and
//! dropped), quoted strings with `+` concatenation, HTML strings, numerals and
//! the three comment forms.

use std::collections::{BTreeMap, HashMap, HashSet};

use super::LayoutError;

pub type Attrs = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Graph {
    pub name: Option<String>,
    pub directed: bool,
    pub strict: bool,
    pub attrs: Attrs,
    /// Nodes in order of first appearance.
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub clusters: Vec<Cluster>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: String,
    pub attrs: Attrs,
}

impl Node {
    pub fn label(&self) -> &str {
        self.attrs.get("label").map(String::as_str).unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub attrs: Attrs,
}

/// A subgraph whose name starts with `cluster`, drawn as a box around its members.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub id: String,
    pub attrs: Attrs,
    pub nodes: Vec<String>,
}

impl Graph {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }
}

const MAX_SUBGRAPH_DEPTH: usize = 256;

pub fn parse(src: &str) -> Result<Graph, LayoutError> {
    let tokens = Lexer::new(src).tokenize()?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        graph: Graph::default(),
        index: HashMap::new(),
        edge_keys: HashSet::new(),
        cluster_keys: HashSet::new(),
        depth: 0,
    };
    parser.parse_graph()?;
    Ok(parser.graph)
}

// -----------------------------------------------------------------------------
// Lexer
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    /// Bare identifier, may be a keyword.
    Ident(String),
    /// Numeral or HTML string; never a keyword.
    Literal(String),
    /// Double-quoted string; never a keyword, may be `+`-concatenated.
    Quoted(String),
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Semi,
    Comma,
    Colon,
    Equals,
    Plus,
    Arrow,
    DashDash,
    Eof,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(s) | Token::Literal(s) => format!("`{}`", s),
            Token::Quoted(s) => format!("\"{}\"", s),
            Token::LBrace => "`{`".into(),
            Token::RBrace => "`}`".into(),
            Token::LBracket => "`[`".into(),
            Token::RBracket => "`]`".into(),
            Token::Semi => "`;`".into(),
            Token::Comma => "`,`".into(),
            Token::Colon => "`:`".into(),
            Token::Equals => "`=`".into(),
            Token::Plus => "`+`".into(),
            Token::Arrow => "`->`".into(),
            Token::DashDash => "`--`".into(),
            Token::Eof => "end of input".into(),
        }
    }
}

#[derive(Debug, Clone)]
struct Spanned {
    token: Token,
    line: usize,
    column: usize,
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
    at_line_start: bool,
}

impl Lexer {
    fn new(src: &str) -> Self {
        Self {
            chars: src.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            at_line_start: true,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
            self.at_line_start = true;
        } else {
            self.column += 1;
            if !c.is_whitespace() {
                self.at_line_start = false;
            }
        }
        Some(c)
    }

    fn error(&self, line: usize, column: usize, message: impl Into<String>) -> LayoutError {
        LayoutError::Parse {
            line,
            column,
            message: message.into(),
        }
    }

    fn tokenize(mut self) -> Result<Vec<Spanned>, LayoutError> {
        let mut out = Vec::new();
        loop {
            self.skip_trivia()?;
            let (line, column) = (self.line, self.column);
            let Some(c) = self.peek() else {
                out.push(Spanned { token: Token::Eof, line, column });
                return Ok(out);
            };
            let token = match c {
                '{' => self.single(Token::LBrace),
                '}' => self.single(Token::RBrace),
                '[' => self.single(Token::LBracket),
                ']' => self.single(Token::RBracket),
                ';' => self.single(Token::Semi),
                ',' => self.single(Token::Comma),
                ':' => self.single(Token::Colon),
                '=' => self.single(Token::Equals),
                '+' => self.single(Token::Plus),
                '"' => self.quoted(line, column)?,
                '<' => self.html(line, column)?,
                '-' if self.peek_at(1) == Some('>') => {
                    self.bump();
                    self.bump();
                    Token::Arrow
                }
                '-' if self.peek_at(1) == Some('-') => {
                    self.bump();
                    self.bump();
                    Token::DashDash
                }
                '-' | '.' | '0'..='9' => self.numeral(line, column)?,
                c if is_ident_start(c) => self.ident(),
                other => return Err(self.error(line, column, format!("unexpected character `{}`", other))),
            };
            out.push(Spanned { token, line, column });
        }
    }

    fn single(&mut self, token: Token) -> Token {
        self.bump();
        token
    }

    fn skip_trivia(&mut self) -> Result<(), LayoutError> {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('#') if self.at_line_start => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some('/') if self.peek_at(1) == Some('/') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some('/') if self.peek_at(1) == Some('*') => {
                    let (line, column) = (self.line, self.column);
                    self.bump();
                    self.bump();
                    loop {
                        match self.peek() {
                            None => return Err(self.error(line, column, "unterminated comment")),
                            Some('*') if self.peek_at(1) == Some('/') => {
                                self.bump();
                                self.bump();
                                break;
                            }
                            Some(_) => {
                                self.bump();
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn ident(&mut self) -> Token {
        let mut value = String::new();
        while let Some(c) = self.peek() {
            if is_ident_start(c) || c.is_ascii_digit() {
                value.push(c);
                self.bump();
            } else {
                break;
            }
        }
        Token::Ident(value)
    }

    fn numeral(&mut self, line: usize, column: usize) -> Result<Token, LayoutError> {
        let mut value = String::new();
        if self.peek() == Some('-') {
            value.push('-');
            self.bump();
        }
        let mut digits = 0;
        let mut seen_dot = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                digits += 1;
            } else if c == '.' && !seen_dot {
                seen_dot = true;
            } else {
                break;
            }
            value.push(c);
            self.bump();
        }
        if digits == 0 {
            return Err(self.error(line, column, format!("malformed number `{}`", value)));
        }
        if let Some(c) = self.peek() {
            if is_ident_start(c) {
                return Err(self.error(
                    self.line,
                    self.column,
                    format!("identifier cannot start with a digit: `{}{}`", value, c),
                ));
            }
        }
        Ok(Token::Literal(value))
    }

    fn quoted(&mut self, line: usize, column: usize) -> Result<Token, LayoutError> {
        self.bump();
        let mut value = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error(line, column, "unterminated string")),
                Some('"') => return Ok(Token::Quoted(value)),
                Some('\\') => match self.peek() {
                    Some('"') => {
                        self.bump();
                        value.push('"');
                    }
                    Some('\n') => {
                        self.bump();
                    }
                    Some('\r') if self.peek_at(1) == Some('\n') => {
                        self.bump();
                        self.bump();
                    }
                    // label escapes such as \n, \l, \r stay for the renderer
                    _ => value.push('\\'),
                },
                Some(c) => value.push(c),
            }
        }
    }

    fn html(&mut self, line: usize, column: usize) -> Result<Token, LayoutError> {
        self.bump();
        let mut depth = 1;
        let mut value = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error(line, column, "unterminated HTML string")),
                Some('<') => {
                    depth += 1;
                    value.push('<');
                }
                Some('>') => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(Token::Literal(value));
                    }
                    value.push('>');
                }
                Some(c) => value.push(c),
            }
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || !c.is_ascii()
}

// -----------------------------------------------------------------------------
// Parser
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct Scope {
    node_defaults: Attrs,
    edge_defaults: Attrs,
    /// Enclosing clusters, outermost first.
    clusters: Vec<usize>,
    /// Innermost cluster receiving `ID = ID` and `graph [...]` statements.
    target: Option<usize>,
    root: bool,
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    graph: Graph,
    index: HashMap<String, usize>,
    edge_keys: HashSet<(String, String)>,
    /// (cluster, node id) pairs already recorded in `Cluster::nodes`.
    cluster_keys: HashSet<(usize, String)>,
    depth: usize,
}

/// Node ids mentioned in a graph or subgraph body, in first-mention order.
#[derive(Debug, Default)]
struct Members {
    ids: Vec<String>,
    seen: HashSet<String>,
}

impl Members {
    fn insert(&mut self, id: &str) {
        if !self.seen.contains(id) {
            self.seen.insert(id.to_string());
            self.ids.push(id.to_string());
        }
    }
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].token
    }

    fn peek_at(&self, offset: usize) -> &Token {
        &self.tokens[(self.pos + offset).min(self.tokens.len() - 1)].token
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn error_here(&self, message: impl Into<String>) -> LayoutError {
        let span = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        LayoutError::Parse {
            line: span.line,
            column: span.column,
            message: message.into(),
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), LayoutError> {
        if *self.peek() == token {
            self.advance();
            Ok(())
        } else {
            Err(self.error_here(format!(
                "expected {}, found {}",
                token.describe(),
                self.peek().describe()
            )))
        }
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Token::Ident(s) if s.eq_ignore_ascii_case(keyword))
    }

    fn peek_is_id(&self) -> bool {
        matches!(self.peek(), Token::Ident(_) | Token::Literal(_) | Token::Quoted(_))
    }

    fn parse_graph(&mut self) -> Result<(), LayoutError> {
        if self.is_keyword("strict") {
            self.advance();
            self.graph.strict = true;
        }
        if self.is_keyword("digraph") {
            self.graph.directed = true;
        } else if !self.is_keyword("graph") {
            return Err(self.error_here(format!(
                "expected `graph` or `digraph`, found {}",
                self.peek().describe()
            )));
        }
        self.advance();
        if self.peek_is_id() {
            self.graph.name = Some(self.parse_id()?);
        }
        self.expect(Token::LBrace)?;
        let mut scope = Scope {
            root: true,
            ..Scope::default()
        };
        let mut members = Members::default();
        self.parse_stmt_list(&mut scope, &mut members)?;
        self.expect(Token::RBrace)?;
        if *self.peek() != Token::Eof {
            return Err(self.error_here(format!(
                "unexpected {} after the graph body",
                self.peek().describe()
            )));
        }
        Ok(())
    }

    fn parse_id(&mut self) -> Result<String, LayoutError> {
        match self.peek().clone() {
            Token::Ident(s) | Token::Literal(s) => {
                self.advance();
                Ok(s)
            }
            Token::Quoted(mut s) => {
                self.advance();
                while *self.peek() == Token::Plus {
                    self.advance();
                    match self.peek().clone() {
                        Token::Quoted(next) => {
                            self.advance();
                            s.push_str(&next);
                        }
                        other => {
                            return Err(self.error_here(format!(
                                "expected a quoted string after `+`, found {}",
                                other.describe()
                            )));
                        }
                    }
                }
                Ok(s)
            }
            other => Err(self.error_here(format!("expected an identifier, found {}", other.describe()))),
        }
    }

    fn parse_stmt_list(&mut self, scope: &mut Scope, members: &mut Members) -> Result<(), LayoutError> {
        loop {
            match self.peek() {
                Token::RBrace | Token::Eof => return Ok(()),
                _ => {
                    self.parse_stmt(scope, members)?;
                    if *self.peek() == Token::Semi {
                        self.advance();
                    }
                }
            }
        }
    }

    fn parse_stmt(&mut self, scope: &mut Scope, members: &mut Members) -> Result<(), LayoutError> {
        for keyword in ["graph", "node", "edge"] {
            if self.is_keyword(keyword) {
                self.advance();
                if *self.peek() != Token::LBracket {
                    return Err(self.error_here(format!("expected `[` after `{}`", keyword)));
                }
                let attrs = self.parse_attr_lists()?;
                match keyword {
                    "graph" => self.apply_graph_attrs(scope, attrs),
                    "node" => scope.node_defaults.extend(attrs),
                    _ => scope.edge_defaults.extend(attrs),
                }
                return Ok(());
            }
        }

        if self.is_keyword("subgraph") || *self.peek() == Token::LBrace {
            let nodes = self.parse_subgraph(scope, members)?;
            if self.peek_is_edge_op() {
                self.parse_edge_chain(nodes, scope, members)?;
            }
            return Ok(());
        }

        if !self.peek_is_id() {
            return Err(self.error_here(format!("expected a statement, found {}", self.peek().describe())));
        }

        if *self.peek_at(1) == Token::Equals {
            let key = self.parse_id()?;
            self.advance();
            let value = self.parse_id()?;
            self.apply_graph_attrs(scope, Attrs::from([(key, value)]));
            return Ok(());
        }

        let id = self.parse_node_id()?;
        if self.peek_is_edge_op() {
            self.touch_node(&id, scope, members, Attrs::new());
            self.parse_edge_chain(vec![id], scope, members)
        } else {
            let attrs = if *self.peek() == Token::LBracket {
                self.parse_attr_lists()?
            } else {
                Attrs::new()
            };
            self.touch_node(&id, scope, members, attrs);
            Ok(())
        }
    }

    fn peek_is_edge_op(&self) -> bool {
        matches!(self.peek(), Token::Arrow | Token::DashDash)
    }

    fn parse_node_id(&mut self) -> Result<String, LayoutError> {
        let id = self.parse_id()?;
        // port and compass point
        for _ in 0..2 {
            if *self.peek() == Token::Colon {
                self.advance();
                self.parse_id()?;
            }
        }
        Ok(id)
    }

    fn parse_attr_lists(&mut self) -> Result<Attrs, LayoutError> {
        let mut attrs = Attrs::new();
        while *self.peek() == Token::LBracket {
            self.advance();
            while *self.peek() != Token::RBracket {
                if !self.peek_is_id() {
                    return Err(self.error_here(format!(
                        "expected an attribute name or `]`, found {}",
                        self.peek().describe()
                    )));
                }
                let key = self.parse_id()?;
                self.expect(Token::Equals)?;
                let value = self.parse_id()?;
                attrs.insert(key, value);
                if matches!(self.peek(), Token::Semi | Token::Comma) {
                    self.advance();
                }
            }
            self.advance();
        }
        Ok(attrs)
    }

    fn parse_subgraph(&mut self, parent: &Scope, members: &mut Members) -> Result<Vec<String>, LayoutError> {
        let mut name = None;
        if self.is_keyword("subgraph") {
            self.advance();
            if self.peek_is_id() {
                name = Some(self.parse_id()?);
            }
        }

        let mut scope = Scope {
            root: false,
            target: None,
            ..parent.clone()
        };
        if let Some(name) = name.as_ref().filter(|n| n.starts_with("cluster")) {
            let idx = match self.graph.clusters.iter().position(|c| &c.id == name) {
                Some(idx) => idx,
                None => {
                    self.graph.clusters.push(Cluster {
                        id: name.clone(),
                        attrs: Attrs::new(),
                        nodes: Vec::new(),
                    });
                    self.graph.clusters.len() - 1
                }
            };
            scope.clusters.push(idx);
            scope.target = Some(idx);
        }

        if self.depth >= MAX_SUBGRAPH_DEPTH {
            return Err(self.error_here(format!(
                "subgraph nesting too deep (limit {})",
                MAX_SUBGRAPH_DEPTH
            )));
        }
        self.expect(Token::LBrace)?;
        self.depth += 1;
        let mut inner = Members::default();
        self.parse_stmt_list(&mut scope, &mut inner)?;
        self.depth -= 1;
        self.expect(Token::RBrace)?;

        for id in &inner.ids {
            members.insert(id);
        }
        Ok(inner.ids)
    }

    fn parse_edge_chain(
        &mut self,
        first: Vec<String>,
        scope: &mut Scope,
        members: &mut Members,
    ) -> Result<(), LayoutError> {
        let mut endpoints = vec![first];
        while self.peek_is_edge_op() {
            if self.graph.directed && *self.peek() == Token::DashDash {
                return Err(self.error_here("`--` used in a directed graph; use `->`"));
            }
            if !self.graph.directed && *self.peek() == Token::Arrow {
                return Err(self.error_here("`->` used in an undirected graph; use `--`"));
            }
            self.advance();
            if self.is_keyword("subgraph") || *self.peek() == Token::LBrace {
                endpoints.push(self.parse_subgraph(scope, members)?);
            } else if self.peek_is_id() {
                let id = self.parse_node_id()?;
                self.touch_node(&id, scope, members, Attrs::new());
                endpoints.push(vec![id]);
            } else {
                return Err(self.error_here(format!(
                    "expected an edge target, found {}",
                    self.peek().describe()
                )));
            }
        }

        let mut attrs = scope.edge_defaults.clone();
        if *self.peek() == Token::LBracket {
            attrs.extend(self.parse_attr_lists()?);
        }

        for pair in endpoints.windows(2) {
            for from in &pair[0] {
                for to in &pair[1] {
                    self.add_edge(from, to, attrs.clone());
                }
            }
        }
        Ok(())
    }

    fn apply_graph_attrs(&mut self, scope: &Scope, attrs: Attrs) {
        if scope.root {
            self.graph.attrs.extend(attrs);
        } else if let Some(idx) = scope.target {
            self.graph.clusters[idx].attrs.extend(attrs);
        }
    }

    fn touch_node(&mut self, id: &str, scope: &Scope, members: &mut Members, attrs: Attrs) {
        match self.index.get(id) {
            Some(&idx) => self.graph.nodes[idx].attrs.extend(attrs),
            None => {
                let mut merged = scope.node_defaults.clone();
                merged.extend(attrs);
                self.index.insert(id.to_string(), self.graph.nodes.len());
                self.graph.nodes.push(Node {
                    id: id.to_string(),
                    attrs: merged,
                });
            }
        }
        for &cluster in &scope.clusters {
            if self.cluster_keys.insert((cluster, id.to_string())) {
                self.graph.clusters[cluster].nodes.push(id.to_string());
            }
        }
        members.insert(id);
    }

    fn add_edge(&mut self, from: &str, to: &str, attrs: Attrs) {
        if self.graph.strict {
            let directed = self.graph.directed;
            let key = if directed || from <= to {
                (from.to_string(), to.to_string())
            } else {
                (to.to_string(), from.to_string())
            };
            if !self.edge_keys.insert(key) {
                if let Some(existing) = self.graph.edges.iter_mut().find(|e| {
                    (e.from == from && e.to == to) || (!directed && e.from == to && e.to == from)
                }) {
                    existing.attrs.extend(attrs);
                }
                return;
            }
        }
        self.graph.edges.push(Edge {
            from: from.to_string(),
            to: to.to_string(),
            attrs,
        });
    }
}
