use ratatui::Frame;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Cell, Clear, Paragraph, Row, Table, TableState, Wrap};

use crate::app::{App, InputMode};
use crate::nav::Overlay;

const BG: Color = Color::Rgb(9, 15, 25);
const PANEL: Color = Color::Rgb(16, 27, 44);
const ACCENT: Color = Color::Rgb(52, 211, 153);
const MUTED: Color = Color::Rgb(140, 156, 178);
const WARN: Color = Color::Rgb(251, 191, 36);
const ERROR: Color = Color::Rgb(248, 113, 113);
const PL_A: Color = Color::Rgb(17, 94, 89);
const PL_B: Color = Color::Rgb(30, 64, 175);
const PL_C: Color = Color::Rgb(55, 48, 163);
const PL_D: Color = Color::Rgb(82, 24, 124);
const PL_E: Color = Color::Rgb(88, 28, 135);

pub fn render(frame: &mut Frame, app: &mut App) {
    let root = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Length(1),
            Constraint::Min(4),
            Constraint::Length(1),
        ])
        .split(frame.area());

    render_header(frame, root[0], app);
    render_breadcrumb(frame, root[1], app);
    render_body(frame, root[2], app);
    render_footer(frame, root[3], app);

    if app.show_help() {
        render_help_modal(frame, app);
    }
}

fn render_header(frame: &mut Frame, area: Rect, app: &App) {
    let left_line = build_left_header_line(app);
    let right_line = build_health_line(app);
    let right_width = spans_width(&right_line.spans) as u16;
    if area.width < 42 || right_width >= area.width {
        frame.render_widget(
            Paragraph::new(left_line).style(Style::default().bg(BG).fg(Color::White)),
            area,
        );
        return;
    }

    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Min(1), Constraint::Length(right_width)])
        .split(area);
    frame.render_widget(
        Paragraph::new(left_line).style(Style::default().bg(BG).fg(Color::White)),
        chunks[0],
    );
    frame.render_widget(
        Paragraph::new(right_line).style(Style::default().bg(BG)),
        chunks[1],
    );
}

fn build_left_header_line(app: &App) -> Line<'static> {
    let query = app.query();
    let mut spans = Vec::new();
    push_powerline_segment(&mut spans, " skiff ", Color::White, PL_A, PL_B);
    push_powerline_segment(
        &mut spans,
        format!(" 󰠳 {} ", compact_text(&display_cluster_endpoint(app.cluster()), 26)),
        Color::White,
        PL_B,
        PL_C,
    );
    push_powerline_segment(
        &mut spans,
        format!(" 󱃾 {}@{} ", compact_text(app.user(), 12), compact_text(app.context(), 14)),
        Color::White,
        PL_C,
        PL_D,
    );
    push_powerline_segment(
        &mut spans,
        format!(" 󰉖 {} ", compact_text(&query.scope.label(), 14)),
        Color::White,
        PL_D,
        PL_E,
    );
    let drill_hint = if app.can_drill_down() { " ⏎" } else { "" };
    push_powerline_segment(
        &mut spans,
        format!(" {}{} ", compact_text(&query.kind.to_string(), 24), drill_hint),
        Color::White,
        PL_E,
        BG,
    );
    Line::from(spans)
}

fn build_health_line(app: &App) -> Line<'static> {
    let (label, bg, fg) = match app.connection_error() {
        Some(_) => (" 󰅚 disconnected (:reconnect) ".to_string(), ERROR, Color::Black),
        None => (" 󰄬 live ".to_string(), ACCENT, Color::Black),
    };
    let mut spans = Vec::new();
    push_powerline_segment_rtl(&mut spans, label, fg, bg, BG);
    Line::from(spans)
}

fn render_breadcrumb(frame: &mut Frame, area: Rect, app: &App) {
    if let Some(error) = app.connection_error() {
        frame.render_widget(
            Paragraph::new(Line::from(Span::styled(
                format!(" {}", compact_text(error, area.width.saturating_sub(2) as usize)),
                Style::default().fg(ERROR),
            )))
            .style(Style::default().bg(BG)),
            area,
        );
        return;
    }

    let mut spans = vec![Span::raw(" ")];
    for (kind, name) in app.breadcrumb() {
        spans.push(Span::styled(kind, Style::default().fg(MUTED)));
        spans.push(Span::styled("/", Style::default().fg(MUTED)));
        spans.push(Span::styled(name, Style::default().fg(Color::White)));
        spans.push(Span::styled(" › ", Style::default().fg(ACCENT)));
    }
    spans.push(Span::styled(
        app.query().kind.resource.clone(),
        Style::default().fg(ACCENT).add_modifier(Modifier::BOLD),
    ));
    for selector in [
        app.query().options.label_selector.as_deref(),
        app.query().options.field_selector.as_deref(),
    ]
    .into_iter()
    .flatten()
    {
        spans.push(Span::styled(
            format!(" [{}]", compact_text(selector, 40)),
            Style::default().fg(MUTED),
        ));
    }
    frame.render_widget(
        Paragraph::new(Line::from(spans)).style(Style::default().bg(BG)),
        area,
    );
}

fn render_body(frame: &mut Frame, area: Rect, app: &mut App) {
    app.set_page_size(table_rows_visible(area));
    let (width, height) = overlay_viewport(area);
    app.set_overlay_viewport(width, height);

    if let Some(overlay) = app.overlay() {
        render_overlay(frame, area, overlay, app.overlay_scroll());
    } else {
        render_table(frame, area, app);
    }
}

fn render_overlay(frame: &mut Frame, area: Rect, overlay: &Overlay, scroll: u16) {
    let text = match overlay {
        Overlay::Describe { text, .. } => highlight_yaml_text(text),
        Overlay::Logs { text, .. } if text.trim().is_empty() => {
            Text::from(Span::styled("(no log lines)", Style::default().fg(MUTED)))
        }
        Overlay::Logs { text, .. } => Text::from(text.clone()),
    };
    let paragraph = Paragraph::new(text)
        .wrap(Wrap { trim: false })
        .scroll((scroll, 0))
        .block(
            Block::default()
                .title(overlay.title().to_string())
                .borders(Borders::ALL)
                .border_style(Style::default().fg(ACCENT))
                .style(Style::default().bg(PANEL)),
        )
        .style(Style::default().fg(Color::White));
    frame.render_widget(paragraph, area);
}

fn render_table(frame: &mut Frame, area: Rect, app: &App) {
    let table = app.table();
    let titles = table.titles();
    let inner_width = area.width.saturating_sub(4);
    let columns = app
        .views()
        .get_columns(inner_width, &table.kind().resource);
    let constraints: Vec<Constraint> = if columns.len() == titles.len() {
        columns
            .iter()
            .map(|(_, width)| Constraint::Length(*width))
            .collect()
    } else {
        column_constraints(titles.len())
    };

    let header_row = Row::new(titles.iter().map(|title| {
        Cell::from(title.clone()).style(Style::default().add_modifier(Modifier::BOLD))
    }))
    .height(1)
    .style(Style::default().fg(ACCENT));

    let rows = app.page_rows().iter().map(|row| {
        Row::new(
            row.iter()
                .map(|column| Cell::from(column.clone()).style(Style::default().fg(Color::White))),
        )
    });

    let title = format!(
        "{} [{}] ({})  page {}/{}",
        table.kind().resource,
        table.scope(),
        table.len(),
        app.page() + 1,
        app.page_count()
    );
    let border = if app.connection_error().is_some() {
        WARN
    } else {
        ACCENT
    };
    let block = Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border))
        .style(Style::default().bg(PANEL));

    let widget = Table::new(rows, constraints)
        .header(header_row)
        .block(block)
        .column_spacing(1)
        .row_highlight_style(
            Style::default()
                .bg(Color::Rgb(24, 36, 58))
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol("󰜴 ");

    let mut state = TableState::default();
    state.select(app.selected_in_page());
    frame.render_stateful_widget(widget, area, &mut state);
}

fn render_footer(frame: &mut Frame, area: Rect, app: &App) {
    if app.mode() == InputMode::Normal {
        let status_text = app.status().to_string();
        let mut spans = Vec::new();
        push_powerline_segment(&mut spans, " 󰘳 nrm ", Color::White, PL_A, PL_B);
        push_powerline_segment(
            &mut spans,
            format!(
                " {} {} ",
                footer_status_icon(&status_text),
                compact_text(&status_text, area.width.saturating_sub(24).max(24) as usize)
            ),
            Color::White,
            PL_B,
            BG,
        );

        let hint = Span::styled(
            format!("depth {} ", app.nav_depth()),
            Style::default().fg(MUTED),
        );
        let hint_width = hint.content.chars().count() as u16;
        let chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Min(1), Constraint::Length(hint_width)])
            .split(area);
        frame.render_widget(
            Paragraph::new(Line::from(spans)).style(Style::default().bg(BG)),
            chunks[0],
        );
        frame.render_widget(
            Paragraph::new(Line::from(hint))
                .style(Style::default().bg(BG))
                .alignment(Alignment::Right),
            chunks[1],
        );
        return;
    }

    let mut spans = Vec::new();
    push_powerline_segment(&mut spans, " 󰘳 cmd ", Color::Black, ACCENT, PL_B);
    push_powerline_segment(
        &mut spans,
        format!(" :{} ", app.input()),
        Color::White,
        PL_B,
        BG,
    );

    let suggestions = app.suggestions();
    if !suggestions.is_empty() {
        let selected = app
            .suggestion_index()
            .min(suggestions.len().saturating_sub(1));
        let start = selected.saturating_sub(2);
        let available_width = area.width as usize;
        let mut used_width = spans_width(&spans) + 1;
        spans.push(Span::raw(" "));
        if start > 0 {
            spans.push(Span::styled("… ", Style::default().fg(MUTED)));
            used_width += 2;
        }
        for (index, item) in suggestions.iter().enumerate().skip(start) {
            let chunk = format!("{item} ");
            let chunk_width = chunk.chars().count();
            if used_width + chunk_width + 1 > available_width {
                spans.push(Span::styled("…", Style::default().fg(MUTED)));
                break;
            }
            let style = if index == selected {
                Style::default()
                    .fg(Color::Black)
                    .bg(Color::Rgb(94, 234, 212))
                    .add_modifier(Modifier::BOLD)
            } else {
                Style::default().fg(MUTED)
            };
            spans.push(Span::styled(chunk, style));
            used_width += chunk_width;
        }
    }

    frame.render_widget(
        Paragraph::new(Line::from(spans)).style(Style::default().bg(BG)),
        area,
    );
}

fn footer_status_icon(status_text: &str) -> &'static str {
    let status = status_text.to_ascii_lowercase();
    let has_failure = [
        "failed",
        "error",
        "timed out",
        "unknown",
        "cannot",
        "refused",
        "forbidden",
        "denied",
    ]
    .iter()
    .any(|needle| status.contains(needle));
    if has_failure { "󰅚" } else { "󰄬" }
}

fn highlight_yaml_text(input: &str) -> Text<'static> {
    Text::from(input.lines().map(highlight_yaml_line).collect::<Vec<_>>())
}

fn highlight_yaml_line(line: &str) -> Line<'static> {
    let indent_len = line
        .as_bytes()
        .iter()
        .take_while(|byte| **byte == b' ')
        .count();
    let (indent, trimmed) = line.split_at(indent_len);

    let mut spans = vec![Span::raw(indent.to_string())];
    if let Some(rest) = trimmed.strip_prefix("- ") {
        spans.push(Span::styled("- ", Style::default().fg(ACCENT)));
        spans.extend(highlight_yaml_content(rest));
    } else if !trimmed.is_empty() {
        spans.extend(highlight_yaml_content(trimmed));
    }
    Line::from(spans)
}

fn highlight_yaml_content(content: &str) -> Vec<Span<'static>> {
    let Some((key, value)) = split_yaml_key_value(content) else {
        return vec![Span::styled(
            content.to_string(),
            Style::default().fg(Color::White),
        )];
    };
    let mut spans = vec![
        Span::styled(
            key.to_string(),
            Style::default().fg(Color::Rgb(103, 232, 249)),
        ),
        Span::styled(":", Style::default().fg(MUTED)),
    ];
    if !value.trim().is_empty() {
        spans.push(Span::raw(" "));
        spans.push(Span::styled(
            value.trim_start().to_string(),
            Style::default().fg(yaml_value_color(value.trim())),
        ));
    }
    spans
}

fn split_yaml_key_value(content: &str) -> Option<(&str, &str)> {
    let (key, value) = content.split_once(':')?;
    let key = key.trim_end();
    if key.is_empty() || key.contains(' ') {
        return None;
    }
    Some((key, value))
}

fn yaml_value_color(value: &str) -> Color {
    if value.starts_with('"') || value.starts_with('\'') {
        Color::Rgb(125, 211, 252)
    } else if matches!(value, "true" | "false" | "null" | "~") {
        WARN
    } else if value.parse::<f64>().is_ok() {
        Color::Rgb(251, 146, 60)
    } else {
        Color::Rgb(147, 197, 253)
    }
}

fn push_powerline_segment(
    spans: &mut Vec<Span<'static>>,
    content: impl Into<String>,
    fg: Color,
    bg: Color,
    next_bg: Color,
) {
    spans.push(Span::styled(
        content.into(),
        Style::default().fg(fg).bg(bg).add_modifier(Modifier::BOLD),
    ));
    spans.push(Span::styled("", Style::default().fg(bg).bg(next_bg)));
}

fn push_powerline_segment_rtl(
    spans: &mut Vec<Span<'static>>,
    content: impl Into<String>,
    fg: Color,
    bg: Color,
    next_bg: Color,
) {
    spans.push(Span::styled("", Style::default().fg(bg).bg(next_bg)));
    spans.push(Span::styled(
        content.into(),
        Style::default().fg(fg).bg(bg).add_modifier(Modifier::BOLD),
    ));
}

fn spans_width(spans: &[Span<'_>]) -> usize {
    spans.iter().map(|span| span.content.chars().count()).sum()
}

fn render_help_modal(frame: &mut Frame, app: &App) {
    let area = centered_rect(78, 60, frame.area());
    frame.render_widget(Clear, area);

    let mut lines = vec![
        Line::from(format!(
            "skiff help  view:{}  scope:{}",
            app.query().kind,
            app.query().scope
        )),
        Line::from(""),
    ];
    lines.extend(app.help_lines().into_iter().map(Line::from));

    let modal = Paragraph::new(lines)
        .wrap(Wrap { trim: false })
        .block(
            Block::default()
                .title("Help")
                .borders(Borders::ALL)
                .border_style(Style::default().fg(ACCENT))
                .style(Style::default().bg(PANEL)),
        )
        .style(Style::default().fg(Color::White));

    frame.render_widget(modal, area);
}

/// Body height minus borders and the header row.
fn table_rows_visible(area: Rect) -> usize {
    area.height.saturating_sub(3).max(1) as usize
}

fn overlay_viewport(area: Rect) -> (u16, u16) {
    let width = area.width.saturating_sub(2).max(1);
    let height = area.height.saturating_sub(2).max(1);
    (width, height)
}

fn compact_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }

    if max_chars <= 1 {
        return "…".to_string();
    }

    let mut out = value
        .chars()
        .take(max_chars.saturating_sub(1))
        .collect::<String>();
    out.push('…');
    out
}

fn display_cluster_endpoint(cluster: &str) -> String {
    let trimmed = cluster.trim().trim_end_matches('/');
    trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed)
        .to_string()
}

fn centered_rect(percent_x: u16, percent_y: u16, area: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(area);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

fn column_constraints(columns: usize) -> Vec<Constraint> {
    if columns == 0 {
        return vec![Constraint::Percentage(100)];
    }

    let width = (100 / columns as u16).max(1);
    (0..columns)
        .map(|_| Constraint::Percentage(width))
        .collect()
}
