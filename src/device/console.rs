//! Text console screen buffer.
//!
//! The guest writes to the console through drawing operations. The buffer
//! keeps the screen plus a bounded scrollback so that a console window that
//! attaches later can be handed the full state in one snapshot.

use std::collections::VecDeque;

use super::{unsupported, Device, DeviceClass, DeviceReply, DeviceRequest};
use crate::error::{Error, Result};
use crate::memory::GuestMemory;

const SNAPSHOT_MAGIC: &[u8; 4] = b"COCS";
const SNAPSHOT_VERSION: u16 = 1;
/// Magic, version, geometry, cursor, scrollback length.
const SNAPSHOT_HEADER_SIZE: usize = 18;

/// One character cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    pub ch: u8,
    pub attr: u8,
}

impl Default for Cell {
    fn default() -> Self {
        Self { ch: b' ', attr: 0x07 }
    }
}

/// Scroll direction.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollDir {
    Up = 0,
    Down = 1,
}

/// Drawing operations sent by the guest console driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleOp {
    PutChar { x: u16, y: u16, cell: Cell },
    PutString { x: u16, y: u16, cells: Vec<Cell> },
    Clear { top: u16, left: u16, bottom: u16, right: u16, cell: Cell },
    Scroll { top: u16, bottom: u16, lines: u16, dir: ScrollDir },
    CursorMove { x: u16, y: u16 },
}

impl ConsoleOp {
    const PUT_CHAR: u8 = 0;
    const PUT_STRING: u8 = 1;
    const CLEAR: u8 = 2;
    const SCROLL: u8 = 3;
    const CURSOR_MOVE: u8 = 4;

    /// Serialize for a console message payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let put16 = |out: &mut Vec<u8>, v: u16| out.extend_from_slice(&v.to_le_bytes());
        match self {
            ConsoleOp::PutChar { x, y, cell } => {
                out.push(Self::PUT_CHAR);
                put16(&mut out, *x);
                put16(&mut out, *y);
                out.extend_from_slice(&[cell.ch, cell.attr]);
            }
            ConsoleOp::PutString { x, y, cells } => {
                out.push(Self::PUT_STRING);
                put16(&mut out, *x);
                put16(&mut out, *y);
                put16(&mut out, cells.len() as u16);
                for cell in cells {
                    out.extend_from_slice(&[cell.ch, cell.attr]);
                }
            }
            ConsoleOp::Clear { top, left, bottom, right, cell } => {
                out.push(Self::CLEAR);
                for v in [*top, *left, *bottom, *right] {
                    put16(&mut out, v);
                }
                out.extend_from_slice(&[cell.ch, cell.attr]);
            }
            ConsoleOp::Scroll { top, bottom, lines, dir } => {
                out.push(Self::SCROLL);
                for v in [*top, *bottom, *lines] {
                    put16(&mut out, v);
                }
                out.push(*dir as u8);
            }
            ConsoleOp::CursorMove { x, y } => {
                out.push(Self::CURSOR_MOVE);
                put16(&mut out, *x);
                put16(&mut out, *y);
            }
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data);
        let op = match r.u8()? {
            Self::PUT_CHAR => ConsoleOp::PutChar {
                x: r.u16()?,
                y: r.u16()?,
                cell: r.cell()?,
            },
            Self::PUT_STRING => {
                let x = r.u16()?;
                let y = r.u16()?;
                let count = r.u16()?;
                let cells = (0..count).map(|_| r.cell()).collect::<Result<Vec<_>>>()?;
                ConsoleOp::PutString { x, y, cells }
            }
            Self::CLEAR => ConsoleOp::Clear {
                top: r.u16()?,
                left: r.u16()?,
                bottom: r.u16()?,
                right: r.u16()?,
                cell: r.cell()?,
            },
            Self::SCROLL => ConsoleOp::Scroll {
                top: r.u16()?,
                bottom: r.u16()?,
                lines: r.u16()?,
                dir: if r.u8()? == ScrollDir::Down as u8 {
                    ScrollDir::Down
                } else {
                    ScrollDir::Up
                },
            },
            Self::CURSOR_MOVE => ConsoleOp::CursorMove {
                x: r.u16()?,
                y: r.u16()?,
            },
            other => {
                return Err(Error::InvalidMessage(format!("unknown console op {}", other)))
            }
        };
        r.finish()?;
        Ok(op)
    }
}

struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let bytes = self
            .data
            .get(self.pos..self.pos + n)
            .ok_or_else(|| Error::InvalidMessage(format!("truncated at offset {}", self.pos)))?;
        self.pos += n;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn cell(&mut self) -> Result<Cell> {
        let b = self.take(2)?;
        Ok(Cell { ch: b[0], attr: b[1] })
    }

    fn finish(&self) -> Result<()> {
        if self.pos != self.data.len() {
            return Err(Error::InvalidMessage(format!(
                "{} trailing bytes",
                self.data.len() - self.pos
            )));
        }
        Ok(())
    }
}

/// Console screen state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Console {
    cols: u16,
    rows: u16,
    /// Screen rows plus scrollback rows
    max_rows: u16,
    screen: Vec<Cell>,
    scrollback: VecDeque<Vec<Cell>>,
    cursor: (u16, u16),
}

impl Console {
    pub fn new(cols: u16, rows: u16, max_rows: u16) -> Self {
        Self {
            cols,
            rows,
            max_rows: max_rows.max(rows),
            screen: vec![Cell::default(); cols as usize * rows as usize],
            scrollback: VecDeque::new(),
            cursor: (0, 0),
        }
    }

    pub fn cols(&self) -> u16 {
        self.cols
    }

    pub fn rows(&self) -> u16 {
        self.rows
    }

    pub fn cursor(&self) -> (u16, u16) {
        self.cursor
    }

    pub fn cell(&self, x: u16, y: u16) -> Option<Cell> {
        self.index(x, y).map(|i| self.screen[i])
    }

    /// Text of one screen row, trailing blanks removed.
    pub fn row_text(&self, y: u16) -> String {
        let start = y as usize * self.cols as usize;
        let row = self.screen.get(start..start + self.cols as usize).unwrap_or(&[]);
        let text: String = row.iter().map(|c| c.ch as char).collect();
        text.trim_end().to_string()
    }

    pub fn scrollback_len(&self) -> usize {
        self.scrollback.len()
    }

    /// Apply one drawing operation. Out-of-screen coordinates are clipped.
    pub fn apply(&mut self, op: &ConsoleOp) {
        match op {
            ConsoleOp::PutChar { x, y, cell } => {
                if let Some(i) = self.index(*x, *y) {
                    self.screen[i] = *cell;
                }
            }
            ConsoleOp::PutString { x, y, cells } => {
                for (dx, cell) in cells.iter().enumerate() {
                    match self.index(x.saturating_add(dx as u16), *y) {
                        Some(i) => self.screen[i] = *cell,
                        None => break,
                    }
                }
            }
            ConsoleOp::Clear { top, left, bottom, right, cell } => {
                let bottom = (*bottom).min(self.rows.saturating_sub(1));
                let right = (*right).min(self.cols.saturating_sub(1));
                for y in *top..=bottom {
                    for x in *left..=right {
                        if let Some(i) = self.index(x, y) {
                            self.screen[i] = *cell;
                        }
                    }
                }
            }
            ConsoleOp::Scroll { top, bottom, lines, dir } => self.scroll(*top, *bottom, *lines, *dir),
            ConsoleOp::CursorMove { x, y } => {
                self.cursor = ((*x).min(self.cols - 1), (*y).min(self.rows - 1));
            }
        }
    }

    fn scroll(&mut self, top: u16, bottom: u16, lines: u16, dir: ScrollDir) {
        let bottom = bottom.min(self.rows.saturating_sub(1));
        if top > bottom || lines == 0 {
            return;
        }
        let cols = self.cols as usize;
        let height = (bottom - top + 1) as usize;
        let lines = (lines as usize).min(height);
        let region = &mut self.screen[top as usize * cols..(bottom as usize + 1) * cols];

        match dir {
            ScrollDir::Up => {
                if top == 0 {
                    for row in region[..lines * cols].chunks(cols) {
                        self.scrollback.push_back(row.to_vec());
                    }
                    let limit = (self.max_rows - self.rows) as usize;
                    while self.scrollback.len() > limit {
                        self.scrollback.pop_front();
                    }
                }
                region.copy_within(lines * cols.., 0);
                let len = region.len();
                region[len - lines * cols..].fill(Cell::default());
            }
            ScrollDir::Down => {
                let len = region.len();
                region.copy_within(..len - lines * cols, lines * cols);
                region[..lines * cols].fill(Cell::default());
            }
        }
    }

    /// Largest snapshot a console of this geometry can produce.
    pub fn max_snapshot_size(cols: u16, rows: u16, max_rows: u16) -> usize {
        SNAPSHOT_HEADER_SIZE + 2 * cols as usize * max_rows.max(rows) as usize
    }

    /// Serialize the whole console state.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            SNAPSHOT_HEADER_SIZE + 2 * (self.screen.len() + self.scrollback.len() * self.cols as usize),
        );
        out.extend_from_slice(SNAPSHOT_MAGIC);
        for v in [
            SNAPSHOT_VERSION,
            self.cols,
            self.rows,
            self.max_rows,
            self.cursor.0,
            self.cursor.1,
            self.scrollback.len() as u16,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for cell in self.scrollback.iter().flatten().chain(self.screen.iter()) {
            out.extend_from_slice(&[cell.ch, cell.attr]);
        }
        out
    }

    /// Rebuild console state from [`Console::snapshot`] output.
    pub fn restore(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data);
        if r.take(4)? != SNAPSHOT_MAGIC {
            return Err(Error::InvalidMessage("bad console snapshot magic".to_string()));
        }
        let version = r.u16()?;
        if version != SNAPSHOT_VERSION {
            return Err(Error::InvalidMessage(format!(
                "unsupported console snapshot version {}",
                version
            )));
        }
        let cols = r.u16()?;
        let rows = r.u16()?;
        let max_rows = r.u16()?;
        let cursor = (r.u16()?, r.u16()?);
        let scrolled = r.u16()? as usize;
        if cols == 0 || rows == 0 || cursor.0 >= cols || cursor.1 >= rows {
            return Err(Error::InvalidMessage("bad console snapshot geometry".to_string()));
        }
        if scrolled > max_rows.saturating_sub(rows) as usize {
            return Err(Error::InvalidMessage(format!(
                "console snapshot has {} scrollback rows, limit {}",
                scrolled,
                max_rows.saturating_sub(rows)
            )));
        }

        let mut console = Console::new(cols, rows, max_rows);
        console.cursor = cursor;
        for _ in 0..scrolled {
            let row = (0..cols).map(|_| r.cell()).collect::<Result<Vec<_>>>()?;
            console.scrollback.push_back(row);
        }
        for cell in console.screen.iter_mut() {
            *cell = r.cell()?;
        }
        r.finish()?;
        Ok(console)
    }

    fn index(&self, x: u16, y: u16) -> Option<usize> {
        (x < self.cols && y < self.rows).then(|| y as usize * self.cols as usize + x as usize)
    }
}

impl Device for Console {
    fn class(&self) -> DeviceClass {
        DeviceClass::Console
    }

    fn request(&mut self, _memory: &mut GuestMemory, request: &DeviceRequest) -> Result<DeviceReply> {
        match request {
            DeviceRequest::Console(op) => {
                self.apply(op);
                Ok(DeviceReply::Done)
            }
            other => Err(unsupported(DeviceClass::Console, other)),
        }
    }

    fn attach(&mut self, _memory: &mut GuestMemory) -> Result<Vec<u8>> {
        Ok(self.snapshot())
    }

    fn detach(&mut self, snapshot: &[u8]) -> Result<()> {
        let restored = Console::restore(snapshot)?;
        if (restored.cols, restored.rows, restored.max_rows) != (self.cols, self.rows, self.max_rows) {
            return Err(Error::InvalidMessage(format!(
                "console snapshot is {}x{} ({} rows kept), console is {}x{} ({} rows kept)",
                restored.cols, restored.rows, restored.max_rows, self.cols, self.rows, self.max_rows
            )));
        }
        *self = restored;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Vec<Cell> {
        s.bytes().map(|ch| Cell { ch, attr: 0x07 }).collect()
    }

    fn put(console: &mut Console, y: u16, s: &str) {
        console.apply(&ConsoleOp::PutString { x: 0, y, cells: text(s) });
    }

    #[test]
    fn test_put_and_clip() {
        let mut console = Console::new(16, 4, 4);
        put(&mut console, 1, "hello");
        console.apply(&ConsoleOp::PutString { x: 14, y: 0, cells: text("abcd") });
        console.apply(&ConsoleOp::PutChar { x: 99, y: 0, cell: Cell::default() });

        assert_eq!(console.row_text(1), "hello");
        assert_eq!(console.row_text(0), "              ab");
    }

    #[test]
    fn test_scroll_up_feeds_scrollback() {
        let mut console = Console::new(16, 3, 5);
        for (y, line) in ["one", "two", "three"].iter().enumerate() {
            put(&mut console, y as u16, line);
        }
        console.apply(&ConsoleOp::Scroll { top: 0, bottom: 2, lines: 1, dir: ScrollDir::Up });
        assert_eq!(console.row_text(0), "two");
        assert_eq!(console.row_text(2), "");
        assert_eq!(console.scrollback_len(), 1);

        for _ in 0..4 {
            console.apply(&ConsoleOp::Scroll { top: 0, bottom: 2, lines: 1, dir: ScrollDir::Up });
        }
        assert_eq!(console.scrollback_len(), 2);

        put(&mut console, 0, "top");
        console.apply(&ConsoleOp::Scroll { top: 0, bottom: 2, lines: 2, dir: ScrollDir::Down });
        assert_eq!(console.row_text(2), "top");
        assert_eq!(console.row_text(0), "");
    }

    #[test]
    fn test_clear_region() {
        let mut console = Console::new(16, 2, 2);
        put(&mut console, 0, "abcdef");
        let cell = Cell::default();
        console.apply(&ConsoleOp::Clear { top: 0, left: 1, bottom: 5, right: 2, cell });
        assert_eq!(console.row_text(0), "a  def");
    }

    #[test]
    fn test_snapshot_restores_equivalent_state() {
        let mut console = Console::new(20, 3, 10);
        put(&mut console, 0, "scrolled away");
        console.apply(&ConsoleOp::Scroll { top: 0, bottom: 2, lines: 1, dir: ScrollDir::Up });
        put(&mut console, 1, "visible");
        console.apply(&ConsoleOp::CursorMove { x: 7, y: 1 });

        let restored = Console::restore(&console.snapshot()).unwrap();
        assert_eq!(restored, console);

        let mut bad = console.snapshot();
        bad[4] = 9;
        assert!(Console::restore(&bad).is_err());
        assert!(Console::restore(&console.snapshot()[..10]).is_err());
    }

    #[test]
    fn test_op_codec() {
        let ops = [
            ConsoleOp::PutString { x: 1, y: 2, cells: text("hi") },
            ConsoleOp::Scroll { top: 0, bottom: 24, lines: 3, dir: ScrollDir::Down },
            ConsoleOp::CursorMove { x: 5, y: 6 },
        ];
        for op in ops {
            assert_eq!(ConsoleOp::decode(&op.encode()).unwrap(), op);
        }
        assert!(ConsoleOp::decode(&[7]).is_err());
        assert!(ConsoleOp::decode(&[4, 0, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_detach_requires_matching_geometry() {
        let mut console = Console::new(20, 3, 3);
        let other = Console::new(30, 3, 3);
        assert!(console.detach(&other.snapshot()).is_err());

        let mut source = console.clone();
        put(&mut source, 0, "from client");
        console.detach(&source.snapshot()).unwrap();
        assert_eq!(console.row_text(0), "from client");
    }

    #[test]
    fn test_full_scrollback_snapshot_fits_bound() {
        let mut console = Console::new(16, 2, 4);
        for _ in 0..10 {
            console.apply(&ConsoleOp::Scroll { top: 0, bottom: 1, lines: 1, dir: ScrollDir::Up });
        }
        assert_eq!(console.scrollback_len(), 2);
        let snapshot = console.snapshot();
        assert_eq!(snapshot.len(), Console::max_snapshot_size(16, 2, 4));

        // Claim a smaller scrollback limit than the rows carried.
        let mut bad = snapshot.clone();
        bad[10..12].copy_from_slice(&3u16.to_le_bytes());
        assert!(matches!(Console::restore(&bad), Err(Error::InvalidMessage(_))));

        let mut wider = Console::new(16, 2, 8);
        assert!(wider.detach(&snapshot).is_err());
    }
}
