use ratatui::{
    layout::Rect,
    style::Color,
    style::Style,
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Frame,
};

fn key(k: &'static str, pad: usize, what: &'static str) -> Line<'static> {
    Line::from(vec![
        Span::raw("  "),
        Span::styled(k, Style::default().fg(Color::Magenta)),
        Span::raw(" ".repeat(pad)),
        Span::raw(what),
    ])
}

pub fn draw_help(area: Rect, f: &mut Frame) {
    let p = Paragraph::new(vec![
        Line::from("Keybinds:"),
        Line::from(vec![
            Span::raw("  "),
            Span::styled("q", Style::default().fg(Color::Magenta)),
            Span::raw(" / "),
            Span::styled("Ctrl-C", Style::default().fg(Color::Magenta)),
            Span::raw("  Quit"),
        ]),
        key("s", 11, "Start a job (replaces a running one)"),
        key("m / M", 7, "Next / previous model"),
        key("c", 11, "Stop following the current job"),
        key("d", 11, "Download output file"),
        key("l", 11, "Download debug log"),
        key("f", 11, "Download failed rows"),
        key("y", 11, "Copy job id to clipboard"),
        key("tab", 9, "Switch tabs"),
        key("?", 11, "Show this help"),
        Line::from(""),
        Line::from("Downloads finished jobs' files automatically unless started with"),
        Line::from("--auto-download false. Files are written to the output directory."),
    ])
    .block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(p, area);
}
