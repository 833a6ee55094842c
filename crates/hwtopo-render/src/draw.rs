//! Drawing contract between a finished topology and output backends

use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

use hwtopo_core::annotate::{collapse_counts, needs_pci_domain};
use hwtopo_core::{ObjectId, Topology};

use crate::color::Color;
use crate::label::object_label;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Failed to write output: {0}")]
    Io(#[from] std::io::Error),
    #[error("Color {0} was used before being declared")]
    UndeclaredColor(Color),
}

/// Primitives an output backend implements.
///
/// Coordinates are in grid units. `depth` orders overlapping shapes, lower
/// values are drawn on top.
pub trait DrawMethods {
    /// Register a color before any shape uses it
    fn declare_color(&mut self, _color: Color) -> Result<(), RenderError> {
        Ok(())
    }

    fn draw_box(
        &mut self,
        color: Color,
        depth: u32,
        x: u32,
        width: u32,
        y: u32,
        height: u32,
    ) -> Result<(), RenderError>;

    fn draw_line(
        &mut self,
        color: Color,
        depth: u32,
        x1: u32,
        y1: u32,
        x2: u32,
        y2: u32,
    ) -> Result<(), RenderError>;

    fn draw_text(
        &mut self,
        color: Color,
        font_size: u32,
        depth: u32,
        x: u32,
        y: u32,
        text: &str,
    ) -> Result<(), RenderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOptions {
    pub font_size: u32,
    pub grid_size: u32,
    /// Fold runs of identical PCI devices into one box
    pub collapse: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            font_size: 10,
            grid_size: 10,
            collapse: true,
        }
    }
}

/// Depth handed to backends for an object at `level` in the tree
fn shape_depth(level: usize) -> u32 {
    100u32.saturating_sub(u32::try_from(level).unwrap_or(u32::MAX))
}

/// Draw every visible object as one indented row, parents linked to their
/// children by a line.
///
/// The topology is only read, so several exports of one topology may run
/// at once. Returns the number of boxes drawn.
pub fn draw_topology<D: DrawMethods>(
    topology: &Topology,
    out: &mut D,
    options: &RenderOptions,
) -> Result<usize, RenderError> {
    let collapsed = if options.collapse {
        collapse_counts(topology)
    } else {
        HashMap::new()
    };
    let show_domain = needs_pci_domain(topology);
    let order = topology.depth_first();

    out.declare_color(Color::BLACK)?;
    let mut declared = Vec::new();
    for &id in &order {
        let color = Color::for_type(topology[id].object_type);
        if !declared.contains(&color) {
            out.declare_color(color)?;
            declared.push(color);
        }
    }

    let grid = options.grid_size;
    let row_height = options.font_size + grid;
    // left edge and vertical middle of each drawn box
    let mut anchors: HashMap<ObjectId, (u32, u32)> = HashMap::new();
    let mut row = 0u32;

    for id in order {
        let count = collapsed.get(&id).copied().unwrap_or(0);
        let Some(label) = object_label(topology, id, count, show_domain) else {
            continue;
        };
        let level = topology.depth_of(id).unwrap_or(0);
        let depth = shape_depth(level);
        let x = u32::try_from(level).unwrap_or(u32::MAX).saturating_mul(2 * grid);
        let y = row * (row_height + grid);
        // rough text width estimate
        let chars = u32::try_from(label.chars().count()).unwrap_or(u32::MAX);
        let width = chars.saturating_mul(options.font_size) / 2 + grid;

        out.draw_box(Color::for_type(topology[id].object_type), depth, x, width, y, row_height)?;
        out.draw_text(Color::BLACK, options.font_size, depth, x + grid / 2, y + grid / 2, &label)?;

        if let Some(&(px, py)) = topology[id].parent().and_then(|p| anchors.get(&p)) {
            out.draw_line(Color::BLACK, depth + 1, px + grid / 2, py, px + grid / 2, y + row_height / 2)?;
            out.draw_line(Color::BLACK, depth + 1, px + grid / 2, y + row_height / 2, x, y + row_height / 2)?;
        }
        anchors.insert(id, (x, y + row_height));
        row += 1;
    }

    debug!(boxes = row, "Drew topology");
    Ok(row as usize)
}
