use std::fmt::Write;

use super::dot::{Attrs, Graph};
use super::layered::{EdgePath, EdgeShape, Layout, LayoutConfig, NodeBox, Shape};

const ARROW_LENGTH: f64 = 10.0;
const ARROW_HALF_WIDTH: f64 = 3.5;

pub fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn attr<'a>(attrs: &'a Attrs, key: &str) -> Option<&'a str> {
    attrs.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

fn has_style(attrs: &Attrs, style: &str) -> bool {
    attrs
        .get("style")
        .map(|s| s.split(',').any(|part| part.trim().eq_ignore_ascii_case(style)))
        .unwrap_or(false)
}

fn dash_attr(attrs: &Attrs) -> &'static str {
    if has_style(attrs, "dashed") {
        " stroke-dasharray=\"5,2\""
    } else if has_style(attrs, "dotted") {
        " stroke-dasharray=\"1,5\""
    } else {
        ""
    }
}

/// Renders a computed layout as a standalone SVG document, structured the
/// way graphviz structures its output (`graph`, `cluster`, `node` and
/// `edge` groups, each with a `<title>`).
pub fn render(graph: &Graph, layout: &Layout, config: &LayoutConfig) -> String {
    let mut svg = String::new();
    let (w, h) = (layout.width.ceil(), layout.height.ceil());
    let _ = writeln!(svg, "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"no\"?>");
    let _ = writeln!(
        svg,
        "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{w}pt\" height=\"{h}pt\" viewBox=\"0.00 0.00 {w:.2} {h:.2}\">"
    );
    let title = graph.name.as_deref().unwrap_or("%0");
    let _ = writeln!(svg, "<g id=\"graph0\" class=\"graph\">");
    let _ = writeln!(svg, "<title>{}</title>", escape_xml(title));
    let background = attr(&graph.attrs, "bgcolor").unwrap_or("white");
    let _ = writeln!(
        svg,
        "<rect x=\"0\" y=\"0\" width=\"{w:.2}\" height=\"{h:.2}\" fill=\"{}\" stroke=\"none\"/>",
        escape_xml(background)
    );

    for (i, cluster) in layout.clusters.iter().enumerate() {
        let attrs = graph
            .clusters
            .iter()
            .find(|c| c.id == cluster.id)
            .map(|c| &c.attrs);
        let empty = Attrs::new();
        let attrs = attrs.unwrap_or(&empty);
        let stroke = attr(attrs, "color").or_else(|| attr(attrs, "pencolor")).unwrap_or("black");
        let fill = if has_style(attrs, "filled") {
            attr(attrs, "fillcolor").or_else(|| attr(attrs, "bgcolor")).unwrap_or("lightgrey")
        } else {
            attr(attrs, "bgcolor").unwrap_or("none")
        };
        let _ = writeln!(svg, "<g id=\"clust{}\" class=\"cluster\">", i + 1);
        let _ = writeln!(svg, "<title>{}</title>", escape_xml(&cluster.id));
        let _ = writeln!(
            svg,
            "<rect x=\"{:.2}\" y=\"{:.2}\" width=\"{:.2}\" height=\"{:.2}\" fill=\"{}\" stroke=\"{}\"{}/>",
            cluster.x,
            cluster.y,
            cluster.width,
            cluster.height,
            escape_xml(fill),
            escape_xml(stroke),
            dash_attr(attrs)
        );
        let first_baseline = cluster.y + config.line_height();
        write_text(
            &mut svg,
            &cluster.label,
            cluster.x + cluster.width / 2.0,
            first_baseline,
            config,
            attr(attrs, "fontcolor").unwrap_or("black"),
        );
        let _ = writeln!(svg, "</g>");
    }

    for (i, node) in layout.nodes.iter().enumerate() {
        let attrs = graph
            .nodes
            .get(i)
            .filter(|n| n.id == node.id)
            .or_else(|| graph.node(&node.id))
            .map(|n| &n.attrs);
        let empty = Attrs::new();
        render_node(&mut svg, i + 1, node, attrs.unwrap_or(&empty), config);
    }

    for (i, edge) in layout.edges.iter().enumerate() {
        let attrs = graph
            .edges
            .get(i)
            .filter(|e| e.from == edge.from && e.to == edge.to)
            .map(|e| &e.attrs);
        let empty = Attrs::new();
        render_edge(&mut svg, i + 1, edge, attrs.unwrap_or(&empty), graph.directed, config);
    }

    if !layout.label.is_empty() {
        let color = attr(&graph.attrs, "fontcolor").unwrap_or("black");
        write_text(&mut svg, &layout.label, layout.label_pos.0, layout.label_pos.1 + config.font_size / 2.0, config, color);
    }

    let _ = writeln!(svg, "</g>");
    svg.push_str("</svg>\n");
    svg
}

fn render_node(svg: &mut String, seq: usize, node: &NodeBox, attrs: &Attrs, config: &LayoutConfig) {
    if has_style(attrs, "invis") {
        return;
    }
    let stroke = attr(attrs, "color").unwrap_or("black");
    let fill = if has_style(attrs, "filled") || node.shape == Shape::Point {
        attr(attrs, "fillcolor").or_else(|| attr(attrs, "color")).unwrap_or("lightgrey")
    } else {
        "none"
    };
    let dash = dash_attr(attrs);
    let (stroke, fill) = (escape_xml(stroke), escape_xml(fill));
    let (x, y, hw, hh) = (node.x, node.y, node.width / 2.0, node.height / 2.0);

    let _ = writeln!(svg, "<g id=\"node{}\" class=\"node\">", seq);
    let _ = writeln!(svg, "<title>{}</title>", escape_xml(&node.id));
    match node.shape {
        Shape::Ellipse | Shape::Circle | Shape::Point => {
            let _ = writeln!(
                svg,
                "<ellipse cx=\"{x:.2}\" cy=\"{y:.2}\" rx=\"{hw:.2}\" ry=\"{hh:.2}\" fill=\"{fill}\" stroke=\"{stroke}\"{dash}/>"
            );
        }
        Shape::Box => {
            let rounded = if has_style(attrs, "rounded") { " rx=\"6\" ry=\"6\"" } else { "" };
            let _ = writeln!(
                svg,
                "<rect x=\"{:.2}\" y=\"{:.2}\" width=\"{:.2}\" height=\"{:.2}\"{rounded} fill=\"{fill}\" stroke=\"{stroke}\"{dash}/>",
                x - hw,
                y - hh,
                node.width,
                node.height
            );
        }
        Shape::Diamond => {
            let _ = writeln!(
                svg,
                "<polygon points=\"{:.2},{:.2} {:.2},{:.2} {:.2},{:.2} {:.2},{:.2}\" fill=\"{fill}\" stroke=\"{stroke}\"{dash}/>",
                x,
                y - hh,
                x + hw,
                y,
                x,
                y + hh,
                x - hw,
                y
            );
        }
        Shape::Plain => {}
    }
    if node.shape != Shape::Point {
        let lines = node.label.len() as f64;
        let first_baseline = y - (lines - 1.0) * config.line_height() / 2.0 + config.font_size * 0.35;
        write_text(svg, &node.label, x, first_baseline, config, attr(attrs, "fontcolor").unwrap_or("black"));
    }
    let _ = writeln!(svg, "</g>");
}

fn render_edge(svg: &mut String, seq: usize, edge: &EdgePath, attrs: &Attrs, directed: bool, config: &LayoutConfig) {
    if has_style(attrs, "invis") {
        return;
    }
    let color = escape_xml(attr(attrs, "color").unwrap_or("black"));
    let dash = dash_attr(attrs);
    let dir = attr(attrs, "dir").unwrap_or(if directed { "forward" } else { "none" });
    let head = matches!(dir, "forward" | "both") && attr(attrs, "arrowhead") != Some("none");
    let tail = matches!(dir, "back" | "both") && attr(attrs, "arrowtail") != Some("none");

    let mut points = edge.points.clone();
    let n = points.len();
    let mut arrows = Vec::new();
    // shorten the path so the arrowhead tip lands on the node outline
    if head && n >= 2 {
        let (tip, before) = (points[n - 1], points[n - 2]);
        arrows.push(arrowhead(before, tip));
        points[n - 1] = retreat(before, tip);
    }
    if tail && n >= 2 {
        let (tip, after) = (points[0], points[1]);
        arrows.push(arrowhead(after, tip));
        points[0] = retreat(after, tip);
    }

    let d = match edge.shape {
        EdgeShape::Line => format!(
            "M{:.2},{:.2} L{:.2},{:.2}",
            points[0].0, points[0].1, points[1].0, points[1].1
        ),
        EdgeShape::Curve => format!(
            "M{:.2},{:.2} Q{:.2},{:.2} {:.2},{:.2}",
            points[0].0, points[0].1, points[1].0, points[1].1, points[2].0, points[2].1
        ),
        EdgeShape::SelfLoop => format!(
            "M{:.2},{:.2} C{:.2},{:.2} {:.2},{:.2} {:.2},{:.2}",
            points[0].0, points[0].1, points[1].0, points[1].1, points[2].0, points[2].1, points[3].0, points[3].1
        ),
    };

    let op = if directed { "&#45;&gt;" } else { "&#45;&#45;" };
    let _ = writeln!(svg, "<g id=\"edge{}\" class=\"edge\">", seq);
    let _ = writeln!(svg, "<title>{}{}{}</title>", escape_xml(&edge.from), op, escape_xml(&edge.to));
    let _ = writeln!(svg, "<path fill=\"none\" stroke=\"{color}\"{dash} d=\"{d}\"/>");
    for polygon in arrows {
        let _ = writeln!(svg, "<polygon fill=\"{color}\" stroke=\"{color}\" points=\"{polygon}\"/>");
    }
    if !edge.label.is_empty() {
        let lines = edge.label.len() as f64;
        let first_baseline = edge.label_pos.1 - (lines - 1.0) * config.line_height() / 2.0 + config.font_size * 0.35;
        write_text_anchored(
            svg,
            &edge.label,
            edge.label_pos.0,
            first_baseline,
            config,
            attr(attrs, "fontcolor").unwrap_or("black"),
            "start",
        );
    }
    let _ = writeln!(svg, "</g>");
}

fn retreat(from: (f64, f64), tip: (f64, f64)) -> (f64, f64) {
    let (dx, dy) = (tip.0 - from.0, tip.1 - from.1);
    let len = (dx * dx + dy * dy).sqrt();
    if len <= ARROW_LENGTH {
        return from;
    }
    (tip.0 - dx / len * ARROW_LENGTH, tip.1 - dy / len * ARROW_LENGTH)
}

fn arrowhead(from: (f64, f64), tip: (f64, f64)) -> String {
    let (dx, dy) = (tip.0 - from.0, tip.1 - from.1);
    let len = (dx * dx + dy * dy).sqrt().max(f64::EPSILON);
    let (ux, uy) = (dx / len, dy / len);
    let base = (tip.0 - ux * ARROW_LENGTH, tip.1 - uy * ARROW_LENGTH);
    let left = (base.0 - uy * ARROW_HALF_WIDTH, base.1 + ux * ARROW_HALF_WIDTH);
    let right = (base.0 + uy * ARROW_HALF_WIDTH, base.1 - ux * ARROW_HALF_WIDTH);
    format!(
        "{:.2},{:.2} {:.2},{:.2} {:.2},{:.2} {:.2},{:.2}",
        left.0, left.1, tip.0, tip.1, right.0, right.1, left.0, left.1
    )
}

fn write_text(svg: &mut String, lines: &[String], x: f64, first_baseline: f64, config: &LayoutConfig, color: &str) {
    write_text_anchored(svg, lines, x, first_baseline, config, color, "middle");
}

fn write_text_anchored(
    svg: &mut String,
    lines: &[String],
    x: f64,
    first_baseline: f64,
    config: &LayoutConfig,
    color: &str,
    anchor: &str,
) {
    for (i, line) in lines.iter().enumerate() {
        if line.is_empty() {
            continue;
        }
        let y = first_baseline + i as f64 * config.line_height();
        let _ = writeln!(
            svg,
            "<text text-anchor=\"{anchor}\" x=\"{x:.2}\" y=\"{y:.2}\" font-family=\"Times,serif\" font-size=\"{:.2}\" fill=\"{}\">{}</text>",
            config.font_size,
            escape_xml(color),
            escape_xml(line)
        );
    }
}
