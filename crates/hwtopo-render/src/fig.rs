//! FIG 3.2 vector output

use std::collections::HashMap;
use std::io::Write;

use crate::color::Color;
use crate::draw::{DrawMethods, RenderError};

/// FIG units per grid unit
const FIG_FACTOR: u32 = 20;

/// First index available for user-defined FIG colors
const FIRST_USER_COLOR: u32 = 32;

const FIG_WHITE: u32 = 7;
const FIG_BLACK: u32 = 0;

/// Writes drawing primitives as a FIG 3.2 document.
///
/// Color indices are numbered per output, so concurrent exports never share
/// state.
pub struct FigOutput<W: Write> {
    writer: W,
    colors: HashMap<Color, u32>,
    next_color: u32,
}

impl<W: Write> FigOutput<W> {
    /// Start a document, writing the FIG header
    pub fn new(mut writer: W) -> Result<Self, RenderError> {
        writeln!(writer, "#FIG 3.2  Produced by hwtopo")?;
        writeln!(writer, "Landscape")?;
        writeln!(writer, "Center")?;
        writeln!(writer, "Inches")?;
        writeln!(writer, "letter")?;
        // magnification
        writeln!(writer, "100.00")?;
        writeln!(writer, "Single")?;
        // no transparent color
        writeln!(writer, "-2")?;
        // 1200 ppi, origin at the upper left
        writeln!(writer, "1200 2")?;
        Ok(Self {
            writer,
            colors: HashMap::new(),
            next_color: FIRST_USER_COLOR,
        })
    }

    fn color_index(&self, color: Color) -> Result<u32, RenderError> {
        match color {
            Color::WHITE => Ok(FIG_WHITE),
            Color::BLACK => Ok(FIG_BLACK),
            _ => self
                .colors
                .get(&color)
                .copied()
                .ok_or(RenderError::UndeclaredColor(color)),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> DrawMethods for FigOutput<W> {
    fn declare_color(&mut self, color: Color) -> Result<(), RenderError> {
        if color == Color::WHITE || color == Color::BLACK || self.colors.contains_key(&color) {
            return Ok(());
        }
        let index = self.next_color;
        self.next_color += 1;
        self.colors.insert(color, index);
        writeln!(self.writer, "0 {} {}", index, color)?;
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
    ) -> Result<(), RenderError> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        let index = self.color_index(color)?;
        let (x, y) = (x * FIG_FACTOR, y * FIG_FACTOR);
        let (x2, y2) = (x + width * FIG_FACTOR, y + height * FIG_FACTOR);
        writeln!(
            self.writer,
            "2 2 0 1 0 {} {} -1 20 0.0 0 0 -1 0 0 5",
            index, depth
        )?;
        writeln!(
            self.writer,
            "\t {} {} {} {} {} {} {} {} {} {}",
            x, y, x2, y, x2, y2, x, y2, x, y
        )?;
        Ok(())
    }

    fn draw_line(
        &mut self,
        color: Color,
        depth: u32,
        x1: u32,
        y1: u32,
        x2: u32,
        y2: u32,
    ) -> Result<(), RenderError> {
        let index = self.color_index(color)?;
        writeln!(
            self.writer,
            "2 1 0 1 0 {} {} -1 -1 0.0 0 0 -1 0 0 2",
            index, depth
        )?;
        writeln!(
            self.writer,
            "\t {} {} {} {}",
            x1 * FIG_FACTOR,
            y1 * FIG_FACTOR,
            x2 * FIG_FACTOR,
            y2 * FIG_FACTOR
        )?;
        Ok(())
    }

    fn draw_text(
        &mut self,
        color: Color,
        font_size: u32,
        depth: u32,
        x: u32,
        y: u32,
        text: &str,
    ) -> Result<(), RenderError> {
        let index = self.color_index(color)?;
        let size = font_size * 16 / 10;
        let len = u32::try_from(text.len()).unwrap_or(u32::MAX);
        writeln!(
            self.writer,
            "4 0 {} {} -1 0 {} 0.0 4 {} {} {} {} {}\\001",
            index,
            depth,
            size,
            size * 10,
            len.saturating_mul(size * 10),
            x * FIG_FACTOR,
            y * FIG_FACTOR + size * 10,
            text
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draw::{draw_topology, RenderOptions};
    use hwtopo_core::{ObjectAttr, ObjectType, PciBusId, PciDevAttr, Topology};

    fn output() -> FigOutput<Vec<u8>> {
        FigOutput::new(Vec::new()).unwrap()
    }

    fn text(fig: FigOutput<Vec<u8>>) -> String {
        String::from_utf8(fig.into_inner()).unwrap()
    }

    #[test]
    fn test_header() {
        let doc = text(output());
        let lines: Vec<_> = doc.lines().collect();
        assert_eq!(lines.len(), 9);
        assert!(lines[0].starts_with("#FIG 3.2"));
        assert_eq!(lines[8], "1200 2");
    }

    #[test]
    fn test_color_registry() {
        let mut fig = output();
        let red = Color::new(0xff, 0, 0);
        let green = Color::new(0, 0xff, 0);
        fig.declare_color(Color::WHITE).unwrap();
        fig.declare_color(red).unwrap();
        fig.declare_color(Color::BLACK).unwrap();
        fig.declare_color(green).unwrap();
        fig.declare_color(red).unwrap();

        assert_eq!(fig.color_index(Color::WHITE).unwrap(), 7);
        assert_eq!(fig.color_index(Color::BLACK).unwrap(), 0);
        assert_eq!(fig.color_index(red).unwrap(), 32);
        assert_eq!(fig.color_index(green).unwrap(), 33);

        let doc = text(fig);
        let declared: Vec<_> = doc.lines().skip(9).collect();
        assert_eq!(declared, vec!["0 32 #ff0000", "0 33 #00ff00"]);
    }

    #[test]
    fn test_registry_is_per_output() {
        let blue = Color::new(0, 0, 0xff);
        let mut first = output();
        first.declare_color(Color::new(1, 2, 3)).unwrap();
        first.declare_color(blue).unwrap();
        let mut second = output();
        second.declare_color(blue).unwrap();
        assert_eq!(first.color_index(blue).unwrap(), 33);
        assert_eq!(second.color_index(blue).unwrap(), 32);
    }

    #[test]
    fn test_shapes() {
        let mut fig = output();
        fig.draw_box(Color::WHITE, 99, 1, 2, 3, 4).unwrap();
        fig.draw_box(Color::WHITE, 99, 1, 0, 3, 4).unwrap();
        fig.draw_line(Color::BLACK, 98, 0, 0, 5, 5).unwrap();
        fig.draw_text(Color::BLACK, 10, 97, 1, 1, "ze0").unwrap();

        let doc = text(fig);
        let body: Vec<_> = doc.lines().skip(9).collect();
        assert_eq!(
            body,
            vec![
                "2 2 0 1 0 7 99 -1 20 0.0 0 0 -1 0 0 5",
                "\t 20 60 60 60 60 140 20 140 20 60",
                "2 1 0 1 0 0 98 -1 -1 0.0 0 0 -1 0 0 2",
                "\t 0 0 100 100",
                "4 0 0 97 -1 0 16 0.0 4 160 480 20 180 ze0\\001",
            ]
        );
    }

    #[test]
    fn test_undeclared_color_rejected() {
        let mut fig = output();
        let err = fig
            .draw_box(Color::new(1, 2, 3), 0, 0, 1, 0, 1)
            .unwrap_err();
        assert!(matches!(err, RenderError::UndeclaredColor(_)));
    }

    #[test]
    fn test_draw_topology_to_fig() {
        let mut topology = Topology::new();
        let core = topology.alloc_object(ObjectType::Core, Some(0));
        topology.insert_by_parent(topology.root(), core).unwrap();

        let mut fig = output();
        let drawn = draw_topology(&topology, &mut fig, &RenderOptions::default()).unwrap();
        assert_eq!(drawn, 2);

        let doc = text(fig);
        assert!(doc.contains("0 32 #bebebe"));
        assert!(doc.contains("Core P#0\\001"));
    }

    #[test]
    fn test_concurrent_exports_of_one_topology() {
        let mut topology = Topology::new();
        for f in 0..2 {
            let obj = topology
                .alloc_object(ObjectType::PciDevice, None)
                .with_attr(ObjectAttr::PciDev(PciDevAttr {
                    busid: PciBusId::new(0, 2, 0, f),
                    ..Default::default()
                }));
            topology.insert_by_parent(topology.root(), obj).unwrap();
        }
        let topology = &topology;

        let docs: Vec<String> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(move || {
                        let mut fig = output();
                        draw_topology(topology, &mut fig, &RenderOptions::default()).unwrap();
                        text(fig)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(docs.iter().all(|doc| *doc == docs[0]));
        // each output numbers its colors from the start
        assert!(docs[0].contains("0 32 #"));
        assert!(docs[0].contains("2 x PCI 02:00.0"));
    }
}
