/// Текущее Unix-время в миллисекундах.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Разложить unix ms на (год, месяц, день) в UTC.
/// Использует алгоритм Howard Hinnant (civil_from_days).
pub fn date_parts_from_ms(ms: i64) -> (i64, u32, u32) {
    let days = ms.div_euclid(86_400_000) + 719468;
    let era = days.div_euclid(146097);
    let doe = days.rem_euclid(146097);
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    (y, m as u32, d as u32)
}

/// Конвертировать unix ms в строку даты `YYYY-MM-DD`.
pub fn date_from_ms(ms: i64) -> String {
    let (y, m, d) = date_parts_from_ms(ms);
    format!("{y:04}-{m:02}-{d:02}")
}

/// `[A-Za-z_][A-Za-z0-9_]*` — безопасно для имён таблиц/колонок и файлов.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Привести произвольное имя (тикер, provider) к идентификатору:
/// недопустимые символы → `_`, ведущая цифра получает префикс `_`.
pub fn sanitize_identifier(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}
