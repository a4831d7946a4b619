//! Text tools: cat, head, tail, wc, sort, uniq, tr, grep, xxd

use super::{fail, gather_inputs, read_all, write_stdout, ProgFut, EXIT_EPIPE};
use crate::guest::registry::GuestCtx;
use crate::wasi::SyscallError;

pub fn cat(ctx: GuestCtx) -> ProgFut {
    Box::pin(async move {
        match cat_impl(&ctx).await {
            Ok(code) => code,
            Err(err) => fail(&ctx, "cat", err).await,
        }
    })
}

async fn cat_impl(ctx: &GuestCtx) -> Result<i32, SyscallError> {
    let files: Vec<String> = ctx.host.args()[1..].to_vec();
    if files.is_empty() {
        // Stream stdin chunk by chunk so pipelines stay incremental.
        loop {
            let chunk = ctx.host.fd_read(0, 4096).await?;
            if chunk.is_empty() {
                return Ok(0);
            }
            match ctx.host.fd_write(1, &chunk).await {
                Ok(_) => {}
                Err(SyscallError::BrokenPipe) => return Ok(EXIT_EPIPE),
                Err(err) => return Err(err),
            }
        }
    }
    let mut status = 0;
    for file in &files {
        match super::read_input(ctx, file).await {
            Ok(data) => {
                ctx.host.fd_write(1, &data).await?;
            }
            Err(err) => {
                let message = format!("cat: {}\n", err);
                ctx.host.fd_write(2, message.as_bytes()).await?;
                status = 1;
            }
        }
    }
    Ok(status)
}

pub fn head(ctx: GuestCtx) -> ProgFut {
    Box::pin(async move {
        match head_impl(&ctx).await {
            Ok(code) => code,
            Err(err) => fail(&ctx, "head", err).await,
        }
    })
}

async fn head_impl(ctx: &GuestCtx) -> Result<i32, SyscallError> {
    let args: Vec<String> = ctx.host.args()[1..].to_vec();
    let mut lines: Option<usize> = Some(10);
    let mut bytes: Option<usize> = None;
    let mut files = Vec::new();
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-n" => {
                lines = iter.next().and_then(|v| v.parse().ok());
                bytes = None;
            }
            "-c" => {
                bytes = iter.next().and_then(|v| v.parse().ok());
                lines = None;
            }
            // Historical `head -5` spelling.
            other if other.starts_with('-') && other[1..].parse::<usize>().is_ok() => {
                lines = other[1..].parse().ok();
                bytes = None;
            }
            _ => files.push(arg),
        }
    }

    if files.is_empty() {
        // Read incrementally and stop as soon as the quota is filled;
        // the remaining producer output is never consumed.
        let mut taken_lines = 0usize;
        let mut taken_bytes = 0usize;
        loop {
            let chunk = ctx.host.fd_read(0, 4096).await?;
            if chunk.is_empty() {
                return Ok(0);
            }
            let mut emit = chunk.len();
            let mut done = false;
            if let Some(limit) = bytes {
                if taken_bytes + chunk.len() >= limit {
                    emit = limit - taken_bytes;
                    done = true;
                }
                taken_bytes += emit;
            } else if let Some(limit) = lines {
                for (i, &b) in chunk.iter().enumerate() {
                    if b == b'\n' {
                        taken_lines += 1;
                        if taken_lines >= limit {
                            emit = i + 1;
                            done = true;
                            break;
                        }
                    }
                }
            }
            match ctx.host.fd_write(1, &chunk[..emit]).await {
                Ok(_) => {}
                Err(SyscallError::BrokenPipe) => return Ok(EXIT_EPIPE),
                Err(err) => return Err(err),
            }
            if done {
                return Ok(0);
            }
        }
    }

    let data = gather_inputs(ctx, &files).await?;
    let out: Vec<u8> = if let Some(limit) = bytes {
        data.into_iter().take(limit).collect()
    } else {
        let limit = lines.unwrap_or(10);
        let mut end = data.len();
        let mut count = 0;
        for (i, &b) in data.iter().enumerate() {
            if b == b'\n' {
                count += 1;
                if count >= limit {
                    end = i + 1;
                    break;
                }
            }
        }
        data[..end].to_vec()
    };
    write_stdout(ctx, &out).await?;
    Ok(0)
}

pub fn tail(ctx: GuestCtx) -> ProgFut {
    Box::pin(async move {
        match tail_impl(&ctx).await {
            Ok(code) => code,
            Err(err) => fail(&ctx, "tail", err).await,
        }
    })
}

async fn tail_impl(ctx: &GuestCtx) -> Result<i32, SyscallError> {
    let args: Vec<String> = ctx.host.args()[1..].to_vec();
    let mut lines = 10usize;
    let mut files = Vec::new();
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-n" => lines = iter.next().and_then(|v| v.parse().ok()).unwrap_or(10),
            _ => files.push(arg),
        }
    }
    let data = gather_inputs(ctx, &files).await?;
    let all: Vec<&[u8]> = data.split_inclusive(|&b| b == b'\n').collect();
    let start = all.len().saturating_sub(lines);
    let mut out = Vec::new();
    for line in &all[start..] {
        out.extend_from_slice(line);
    }
    write_stdout(ctx, &out).await?;
    Ok(0)
}

pub fn wc(ctx: GuestCtx) -> ProgFut {
    Box::pin(async move {
        match wc_impl(&ctx).await {
            Ok(code) => code,
            Err(err) => fail(&ctx, "wc", err).await,
        }
    })
}

async fn wc_impl(ctx: &GuestCtx) -> Result<i32, SyscallError> {
    let args: Vec<String> = ctx.host.args()[1..].to_vec();
    let mut show_lines = false;
    let mut show_words = false;
    let mut show_bytes = false;
    let mut files = Vec::new();
    for arg in args {
        match arg.as_str() {
            "-l" => show_lines = true,
            "-w" => show_words = true,
            "-c" => show_bytes = true,
            _ => files.push(arg),
        }
    }
    if !show_lines && !show_words && !show_bytes {
        show_lines = true;
        show_words = true;
        show_bytes = true;
    }

    let data = gather_inputs(ctx, &files).await?;
    let line_count = data.iter().filter(|&&b| b == b'\n').count();
    let word_count = String::from_utf8_lossy(&data).split_whitespace().count();
    let byte_count = data.len();

    let mut fields = Vec::new();
    if show_lines {
        fields.push(line_count.to_string());
    }
    if show_words {
        fields.push(word_count.to_string());
    }
    if show_bytes {
        fields.push(byte_count.to_string());
    }
    let out = format!("{}\n", fields.join(" "));
    write_stdout(ctx, out.as_bytes()).await?;
    Ok(0)
}

pub fn sort(ctx: GuestCtx) -> ProgFut {
    Box::pin(async move {
        match sort_impl(&ctx).await {
            Ok(code) => code,
            Err(err) => fail(&ctx, "sort", err).await,
        }
    })
}

async fn sort_impl(ctx: &GuestCtx) -> Result<i32, SyscallError> {
    let args: Vec<String> = ctx.host.args()[1..].to_vec();
    let mut reverse = false;
    let mut unique = false;
    let mut numeric = false;
    let mut files = Vec::new();
    for arg in args {
        match arg.as_str() {
            "-r" => reverse = true,
            "-u" => unique = true,
            "-n" => numeric = true,
            _ => files.push(arg),
        }
    }
    let data = gather_inputs(ctx, &files).await?;
    let text = String::from_utf8_lossy(&data);
    let mut all: Vec<&str> = text.lines().collect();
    if numeric {
        all.sort_by(|a, b| {
            let x: f64 = a.trim().parse().unwrap_or(0.0);
            let y: f64 = b.trim().parse().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal)
        });
    } else {
        all.sort();
    }
    if unique {
        all.dedup();
    }
    if reverse {
        all.reverse();
    }
    let mut out = all.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    write_stdout(ctx, out.as_bytes()).await?;
    Ok(0)
}

pub fn uniq(ctx: GuestCtx) -> ProgFut {
    Box::pin(async move {
        match uniq_impl(&ctx).await {
            Ok(code) => code,
            Err(err) => fail(&ctx, "uniq", err).await,
        }
    })
}

async fn uniq_impl(ctx: &GuestCtx) -> Result<i32, SyscallError> {
    let args: Vec<String> = ctx.host.args()[1..].to_vec();
    let mut count = false;
    let mut files = Vec::new();
    for arg in args {
        match arg.as_str() {
            "-c" => count = true,
            _ => files.push(arg),
        }
    }
    let data = gather_inputs(ctx, &files).await?;
    let text = String::from_utf8_lossy(&data);
    let mut out = String::new();
    let mut previous: Option<&str> = None;
    let mut run = 0usize;
    for line in text.lines().chain(std::iter::once("\0sentinel")) {
        match previous {
            Some(prev) if prev == line => run += 1,
            Some(prev) => {
                if count {
                    out.push_str(&format!("{:7} {}\n", run, prev));
                } else {
                    out.push_str(prev);
                    out.push('\n');
                }
                previous = Some(line);
                run = 1;
            }
            None => {
                previous = Some(line);
                run = 1;
            }
        }
    }
    write_stdout(ctx, out.as_bytes()).await?;
    Ok(0)
}

pub fn tr(ctx: GuestCtx) -> ProgFut {
    Box::pin(async move {
        match tr_impl(&ctx).await {
            Ok(code) => code,
            Err(err) => fail(&ctx, "tr", err).await,
        }
    })
}

fn expand_tr_set(set: &str) -> Vec<char> {
    // Backslash escapes first, then a-b ranges.
    let mut chars: Vec<char> = Vec::new();
    let mut iter = set.chars();
    while let Some(c) = iter.next() {
        if c == '\\' {
            match iter.next() {
                Some('n') => chars.push('\n'),
                Some('t') => chars.push('\t'),
                Some('r') => chars.push('\r'),
                Some('0') => chars.push('\0'),
                Some(other) => chars.push(other),
                None => chars.push('\\'),
            }
        } else {
            chars.push(c);
        }
    }
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if i + 2 < chars.len() && chars[i + 1] == '-' {
            let (start, end) = (chars[i], chars[i + 2]);
            for c in start..=end {
                out.push(c);
            }
            i += 3;
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    out
}

async fn tr_impl(ctx: &GuestCtx) -> Result<i32, SyscallError> {
    let args: Vec<String> = ctx.host.args()[1..].to_vec();
    let mut delete = false;
    let mut sets = Vec::new();
    for arg in args {
        match arg.as_str() {
            "-d" => delete = true,
            _ => sets.push(arg),
        }
    }
    let data = read_all(ctx, 0).await?;
    let text = String::from_utf8_lossy(&data);

    let out: String = if delete {
        let set1 = expand_tr_set(sets.first().map(|s| s.as_str()).unwrap_or(""));
        text.chars().filter(|c| !set1.contains(c)).collect()
    } else {
        if sets.len() < 2 {
            ctx.host.fd_write(2, b"tr: missing operand\n").await?;
            return Ok(1);
        }
        let set1 = expand_tr_set(&sets[0]);
        let set2 = expand_tr_set(&sets[1]);
        text.chars()
            .map(|c| match set1.iter().position(|&s| s == c) {
                Some(i) => *set2.get(i).or(set2.last()).unwrap_or(&c),
                None => c,
            })
            .collect()
    };
    write_stdout(ctx, out.as_bytes()).await?;
    Ok(0)
}

pub fn grep(ctx: GuestCtx) -> ProgFut {
    Box::pin(async move {
        match grep_impl(&ctx).await {
            Ok(code) => code,
            Err(err) => fail(&ctx, "grep", err).await,
        }
    })
}

async fn grep_impl(ctx: &GuestCtx) -> Result<i32, SyscallError> {
    let args: Vec<String> = ctx.host.args()[1..].to_vec();
    let mut invert = false;
    let mut ignore_case = false;
    let mut rest = Vec::new();
    for arg in args {
        match arg.as_str() {
            "-v" => invert = true,
            "-i" => ignore_case = true,
            _ => rest.push(arg),
        }
    }
    let Some(pattern) = rest.first().cloned() else {
        ctx.host
            .fd_write(2, b"usage: grep [-iv] pattern [file...]\n")
            .await?;
        return Ok(2);
    };
    let files = rest[1..].to_vec();
    let needle = if ignore_case {
        pattern.to_lowercase()
    } else {
        pattern.clone()
    };

    let data = gather_inputs(ctx, &files).await?;
    let text = String::from_utf8_lossy(&data);
    let mut out = String::new();
    let mut matched = false;
    for line in text.lines() {
        let haystack = if ignore_case {
            line.to_lowercase()
        } else {
            line.to_string()
        };
        let hit = haystack.contains(&needle);
        if hit != invert {
            matched = true;
            out.push_str(line);
            out.push('\n');
        }
    }
    write_stdout(ctx, out.as_bytes()).await?;
    Ok(if matched { 0 } else { 1 })
}

pub fn xxd(ctx: GuestCtx) -> ProgFut {
    Box::pin(async move {
        match xxd_impl(&ctx).await {
            Ok(code) => code,
            Err(err) => fail(&ctx, "xxd", err).await,
        }
    })
}

async fn xxd_impl(ctx: &GuestCtx) -> Result<i32, SyscallError> {
    let args: Vec<String> = ctx.host.args()[1..].to_vec();
    let mut plain = false;
    let mut files = Vec::new();
    for arg in args {
        match arg.as_str() {
            "-p" => plain = true,
            _ => files.push(arg),
        }
    }
    let data = gather_inputs(ctx, &files).await?;

    let mut out = String::new();
    if plain {
        // 60 hex digits (30 bytes) per line, matching xxd -p.
        for (i, byte) in data.iter().enumerate() {
            out.push_str(&format!("{:02x}", byte));
            if (i + 1) % 30 == 0 {
                out.push('\n');
            }
        }
        if data.len() % 30 != 0 {
            out.push('\n');
        }
    } else {
        for (offset, chunk) in data.chunks(16).enumerate() {
            let mut hex = String::new();
            for pair in chunk.chunks(2) {
                for byte in pair {
                    hex.push_str(&format!("{:02x}", byte));
                }
                hex.push(' ');
            }
            let ascii: String = chunk
                .iter()
                .map(|&b| {
                    let c = b as char;
                    if c.is_ascii_graphic() || c == ' ' {
                        c
                    } else {
                        '.'
                    }
                })
                .collect();
            out.push_str(&format!("{:08x}: {:<40} {}\n", offset * 16, hex, ascii));
        }
    }
    write_stdout(ctx, out.as_bytes()).await?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use crate::programs::testutil::bench;

    #[test]
    fn test_cat_stdin() {
        let bench = bench();
        assert_eq!(bench.run("cat", &[], b"pass through\n"), 0);
        assert_eq!(bench.stdout_str(), "pass through\n");
    }

    #[test]
    fn test_cat_file() {
        let bench = bench();
        bench
            .kernel
            .vfs()
            .borrow_mut()
            .write_file("/home/user/f.txt", b"file data\n")
            .unwrap();
        assert_eq!(bench.run("cat", &["f.txt"], b""), 0);
        assert_eq!(bench.stdout_str(), "file data\n");
    }

    #[test]
    fn test_cat_missing_file() {
        let bench = bench();
        assert_eq!(bench.run("cat", &["nope.txt"], b""), 1);
    }

    #[test]
    fn test_head_lines() {
        let bench = bench();
        bench.run("head", &["-n", "2"], b"a\nb\nc\nd\n");
        assert_eq!(bench.stdout_str(), "a\nb\n");
    }

    #[test]
    fn test_head_bytes() {
        let bench = bench();
        bench.run("head", &["-c", "4"], b"abcdefgh");
        assert_eq!(bench.stdout_str(), "abcd");
    }

    #[test]
    fn test_tail() {
        let bench = bench();
        bench.run("tail", &["-n", "2"], b"a\nb\nc\n");
        assert_eq!(bench.stdout_str(), "b\nc\n");
    }

    #[test]
    fn test_wc_default() {
        let bench = bench();
        bench.run("wc", &[], b"one two\nthree\n");
        assert_eq!(bench.stdout_str(), "2 3 14\n");
    }

    #[test]
    fn test_wc_lines_only() {
        let bench = bench();
        bench.run("wc", &["-l"], b"a\nb\n");
        assert_eq!(bench.stdout_str(), "2\n");
    }

    #[test]
    fn test_sort_and_flags() {
        let bench1 = bench();
        bench1.run("sort", &[], b"b\na\nc\n");
        assert_eq!(bench1.stdout_str(), "a\nb\nc\n");

        let bench2 = bench();
        bench2.run("sort", &["-r", "-u"], b"b\na\nb\n");
        assert_eq!(bench2.stdout_str(), "b\na\n");

        let bench3 = bench();
        bench3.run("sort", &["-n"], b"10\n2\n1\n");
        assert_eq!(bench3.stdout_str(), "1\n2\n10\n");
    }

    #[test]
    fn test_uniq() {
        let bench = bench();
        bench.run("uniq", &[], b"a\na\nb\na\n");
        assert_eq!(bench.stdout_str(), "a\nb\na\n");
    }

    #[test]
    fn test_tr_translate_and_delete() {
        let bench1 = bench();
        bench1.run("tr", &["a-c", "A-C"], b"abcd");
        assert_eq!(bench1.stdout_str(), "ABCd");

        let bench2 = bench();
        bench2.run("tr", &["-d", "l"], b"hello");
        assert_eq!(bench2.stdout_str(), "heo");
    }

    #[test]
    fn test_grep() {
        let bench1 = bench();
        assert_eq!(bench1.run("grep", &["ne"], b"one\ntwo\nnine\n"), 0);
        assert_eq!(bench1.stdout_str(), "one\nnine\n");

        let bench2 = bench();
        assert_eq!(bench2.run("grep", &["-v", "ne"], b"one\ntwo\n"), 0);
        assert_eq!(bench2.stdout_str(), "two\n");

        let bench3 = bench();
        assert_eq!(bench3.run("grep", &["zz"], b"one\n"), 1);
    }

    #[test]
    fn test_xxd_plain() {
        let bench = bench();
        bench.run("xxd", &["-p"], &[0, 0, 0, 0]);
        assert_eq!(bench.stdout_str(), "00000000\n");
    }
}
