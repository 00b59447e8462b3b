//! Row-based flow diagrams derived from generated workflow source.
//!
//! The diagram is a pure function of the source text: the same text always
//! renders byte-identical SVG, independent of any execution.

/// Geometry shared by layout and rendering.
pub const MIN_WIDTH: i64 = 100;
pub const MIN_HEIGHT: i64 = 100;
pub const SYMBOL_RADIUS: i64 = 15;
pub const PADDING: i64 = 10;

/// One visual node in the diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSymbol {
    Start,
    End,
    Call { line: u32 },
    Junction { line: u32 },
}

/// A symbol with its layout geometry: the center plus the two connection
/// points directly above and below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacedSymbol {
    pub symbol: FlowSymbol,
    pub center: (i64, i64),
    pub upper: (i64, i64),
    pub lower: (i64, i64),
}

/// The laid-out diagram: canvas size plus placed rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub width: i64,
    pub height: i64,
    pub rows: Vec<Vec<PlacedSymbol>>,
}

/// Rows of flow symbols parsed from source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flowchart {
    rows: Vec<Vec<FlowSymbol>>,
}

impl Flowchart {
    /// Parse pass. Walks the source line by line, skipping the entry-point
    /// declaration (first line) and blank lines:
    ///
    /// - an individually awaited capability call sits alone on its own row;
    /// - a `Wait` opens a junction row by itself, followed by a fresh row;
    /// - any other capability call shares the current row;
    /// - the sequence starts with a `Start` row and ends with an `End`
    ///   appended to the final row.
    pub fn from_source(source: &str) -> Self {
        let mut rows: Vec<Vec<FlowSymbol>> = vec![vec![FlowSymbol::Start], Vec::new()];

        for (idx, raw) in source.lines().enumerate().skip(1) {
            let line_no = (idx + 1) as u32;
            let text = raw.trim();
            if text.is_empty() || !text.contains("MCP.") {
                continue;
            }

            if text.contains("MCP.Wait(") {
                rows.push(vec![FlowSymbol::Junction { line: line_no }]);
                rows.push(Vec::new());
            } else if text.contains("await") {
                rows.last_mut()
                    .expect("rows are never empty")
                    .push(FlowSymbol::Call { line: line_no });
                rows.push(Vec::new());
            } else {
                rows.last_mut()
                    .expect("rows are never empty")
                    .push(FlowSymbol::Call { line: line_no });
            }
        }

        rows.last_mut()
            .expect("rows are never empty")
            .push(FlowSymbol::End);
        rows.retain(|row| !row.is_empty());
        Flowchart { rows }
    }

    pub fn rows(&self) -> &[Vec<FlowSymbol>] {
        &self.rows
    }

    /// Layout pass. Row vertical centers advance by one symbol diameter then
    /// one padding unit per row; within a row, horizontal centers start from
    /// an offset that pre-compensates for the row's width and advance one
    /// diameter (plus a radius nudge for odd-count rows) and one padding unit
    /// per symbol.
    pub fn layout(&self) -> Layout {
        let mut rows = Vec::with_capacity(self.rows.len());
        let mut row_center = 0i64;

        for row in &self.rows {
            row_center += 2 * SYMBOL_RADIUS;
            let count = row.len() as i64;
            let mut column_center = PADDING + (count / 2) * 2 * SYMBOL_RADIUS;

            let mut placed = Vec::with_capacity(row.len());
            for symbol in row {
                column_center += 2 * SYMBOL_RADIUS;
                if count % 2 == 1 {
                    column_center += SYMBOL_RADIUS;
                }
                placed.push(PlacedSymbol {
                    symbol: *symbol,
                    center: (column_center, row_center),
                    upper: (column_center, row_center - SYMBOL_RADIUS),
                    lower: (column_center, row_center + SYMBOL_RADIUS),
                });
                column_center += PADDING;
            }
            rows.push(placed);
            row_center += PADDING;
        }

        let widest = self.rows.iter().map(Vec::len).max().unwrap_or(0) as i64;
        Layout {
            width: MIN_WIDTH.max(widest * (2 * SYMBOL_RADIUS + PADDING)),
            height: MIN_HEIGHT.max(
                self.rows.len() as i64 * (2 * SYMBOL_RADIUS + PADDING) + 2 * PADDING,
            ),
            rows,
        }
    }

    /// Render pass. Each symbol draws its own shape at its computed center;
    /// a connector runs from every symbol's lower connection point in one row
    /// to every symbol's upper connection point in the next (all pairs, since
    /// row membership does not encode which upstream call feeds which
    /// downstream one).
    pub fn to_svg(&self) -> String {
        let layout = self.layout();
        let mut svg = format!(
            "<svg version=\"1.1\" width=\"{}\" height=\"{}\" xmlns=\"http://www.w3.org/2000/svg\">",
            layout.width, layout.height
        );

        for row in &layout.rows {
            for placed in row {
                svg.push_str(&symbol_svg(placed));
            }
        }

        for pair in layout.rows.windows(2) {
            for upper_symbol in &pair[0] {
                for lower_symbol in &pair[1] {
                    svg.push_str(&format!(
                        "<line x1=\"{}\" y1=\"{}\" x2=\"{}\" y2=\"{}\" stroke-width=\"1\" stroke=\"blue\" />",
                        upper_symbol.lower.0,
                        upper_symbol.lower.1,
                        lower_symbol.upper.0,
                        lower_symbol.upper.1,
                    ));
                }
            }
        }

        svg.push_str("</svg>");
        svg
    }
}

fn symbol_svg(placed: &PlacedSymbol) -> String {
    let (cx, cy) = placed.center;
    let r = SYMBOL_RADIUS;
    match placed.symbol {
        FlowSymbol::Start => {
            format!("<circle cx=\"{cx}\" cy=\"{cy}\" r=\"{r}\" fill=\"black\" />")
        }
        FlowSymbol::End => format!(
            "<circle cx=\"{cx}\" cy=\"{cy}\" r=\"{r}\" fill=\"lightgray\" stroke=\"black\" stroke-width=\"2\"/>\
<circle cx=\"{cx}\" cy=\"{cy}\" r=\"{half}\" fill=\"black\"/>",
            half = r as f64 / 2.0
        ),
        FlowSymbol::Call { line } => format!(
            "<rect x=\"{x}\" y=\"{y}\" width=\"{side}\" height=\"{side}\" fill=\"lightgray\" id=\"line{line}\" stroke=\"black\" stroke-width=\"2\"/>\
<text x=\"{cx}\" y=\"{cy}\" dominant-baseline=\"middle\" text-anchor=\"middle\">{line}</text>",
            x = cx - r,
            y = cy - r,
            side = 2 * r,
        ),
        FlowSymbol::Junction { line } => format!(
            "<polygon points=\"{cx},{top} {right},{cy} {cx},{bottom} {left},{cy}\" fill=\"lightgray\" id=\"line{line}\" stroke=\"black\" stroke-width=\"2\"/>\
<text x=\"{cx}\" y=\"{cy}\" dominant-baseline=\"middle\" text-anchor=\"middle\">{line}</text>",
            top = cy - r,
            right = cx + r,
            bottom = cy + r,
            left = cx - r,
        ),
    }
}
