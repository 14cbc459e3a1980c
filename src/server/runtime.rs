/// Container-aware CPU limit detection for sizing the tokio worker pool.
///
/// Detection order:
/// 1. `TOLLGATE_CPU_LIMIT` env var (explicit override, "4" or "4000m")
/// 2. cgroup v2: `/sys/fs/cgroup/cpu.max`
/// 3. Fallback: `std::thread::available_parallelism()` (host CPU count)
///
/// Without this, tokio defaults to the host CPU count, which
/// over-provisions threads when a container is limited to a few cores on a
/// large host.
pub fn worker_thread_count() -> usize {
    if let Ok(cpu_limit) = std::env::var("TOLLGATE_CPU_LIMIT") {
        if let Some(cores) = parse_cpu_value(&cpu_limit) {
            let threads = cores.max(1);
            eprintln!("[runtime] using CPU limit from TOLLGATE_CPU_LIMIT: {threads} threads");
            return threads;
        }
    }

    if let Ok(max) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        if let Some(cores) = parse_cgroup_v2_cpu(&max) {
            let threads = cores.max(1);
            eprintln!("[runtime] using CPU limit from cgroup v2: {threads} threads");
            return threads;
        }
    }

    let threads = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1);
    eprintln!("[runtime] using system CPU count: {threads} threads");
    threads
}

/// Parse CPU value — supports "4" (cores) or "4000m" (millicores) format.
fn parse_cpu_value(value: &str) -> Option<usize> {
    let value = value.trim();
    if let Some(stripped) = value.strip_suffix('m') {
        stripped.parse::<usize>().ok().map(|m| m / 1000)
    } else {
        value.parse::<usize>().ok()
    }
}

/// Parse cgroup v2 `cpu.max` — format: "quota period" or "max period".
fn parse_cgroup_v2_cpu(content: &str) -> Option<usize> {
    let parts: Vec<&str> = content.split_whitespace().collect();
    if parts.len() >= 2 {
        if parts[0] == "max" {
            return None; // unlimited
        }
        let quota: i64 = parts[0].parse().ok()?;
        let period: i64 = parts[1].parse().ok()?;
        if quota > 0 && period > 0 {
            return Some((quota / period) as usize);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_value_cores() {
        assert_eq!(parse_cpu_value("4"), Some(4));
        assert_eq!(parse_cpu_value("  8  "), Some(8));
        assert_eq!(parse_cpu_value("x"), None);
    }

    #[test]
    fn test_parse_cpu_value_millicores() {
        assert_eq!(parse_cpu_value("4000m"), Some(4));
        assert_eq!(parse_cpu_value("500m"), Some(0)); // caller clamps to 1
    }

    #[test]
    fn test_parse_cgroup_v2_cpu() {
        assert_eq!(parse_cgroup_v2_cpu("400000 100000"), Some(4));
        assert_eq!(parse_cgroup_v2_cpu("max 100000"), None);
        assert_eq!(parse_cgroup_v2_cpu(""), None);
    }
}
