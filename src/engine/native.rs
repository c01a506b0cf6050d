use super::layered::{self, LayoutConfig};
use super::{LayoutEngine, LayoutError, LayoutOptions, dot, svg};

/// In-process engine: DOT parser, layered layout and SVG renderer.
#[derive(Debug, Clone, Default)]
pub struct NativeLayoutEngine;

impl NativeLayoutEngine {
    pub fn new() -> Self {
        Self
    }
}

impl LayoutEngine for NativeLayoutEngine {
    fn name(&self) -> &str {
        "native"
    }

    fn render(&self, graph: &str, options: &LayoutOptions) -> Result<String, LayoutError> {
        if !options.engine.eq_ignore_ascii_case("dot") {
            return Err(LayoutError::Unsupported(format!("engine `{}`", options.engine)));
        }
        let graph = dot::parse(graph)?;
        let config = LayoutConfig::for_graph(&graph)?;
        let layout = layered::compute(&graph, &config)?;
        Ok(svg::render(&graph, &layout, &config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renders_svg() {
        let out = NativeLayoutEngine::new()
            .render("digraph{a->b}", &LayoutOptions::default())
            .unwrap();
        assert!(out.contains("<svg"));
        assert!(out.contains("<title>a</title>"));
    }

    #[test]
    fn test_rejects_malformed_graph() {
        let err = NativeLayoutEngine::new()
            .render("not a graph", &LayoutOptions::default())
            .unwrap_err();
        assert!(matches!(err, LayoutError::Parse { line: 1, column: 1, .. }));
    }

    #[test]
    fn test_rejects_unknown_engine() {
        let options = LayoutOptions {
            engine: "neato".into(),
            ..LayoutOptions::default()
        };
        let err = NativeLayoutEngine::new().render("digraph{}", &options).unwrap_err();
        assert_eq!(err, LayoutError::Unsupported("engine `neato`".into()));
    }
}
