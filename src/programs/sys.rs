//! Process-ish tools: echo, seq, yes, sleep, env, pwd, true, false

use super::{fail, write_stdout, ProgFut, EXIT_EPIPE};
use crate::guest::registry::GuestCtx;
use crate::wasi::SyscallError;

pub fn echo(ctx: GuestCtx) -> ProgFut {
    Box::pin(async move {
        let args: Vec<String> = ctx.host.args()[1..].to_vec();
        let (newline, args) = match args.first().map(|s| s.as_str()) {
            Some("-n") => (false, &args[1..]),
            _ => (true, &args[..]),
        };
        let mut out = args.join(" ");
        if newline {
            out.push('\n');
        }
        match write_stdout(&ctx, out.as_bytes()).await {
            Ok(()) => 0,
            Err(err) => fail(&ctx, "echo", err).await,
        }
    })
}

pub fn seq(ctx: GuestCtx) -> ProgFut {
    Box::pin(async move {
        match seq_impl(&ctx).await {
            Ok(code) => code,
            Err(err) => fail(&ctx, "seq", err).await,
        }
    })
}

async fn seq_impl(ctx: &GuestCtx) -> Result<i32, SyscallError> {
    let args = &ctx.host.args()[1..];
    let numbers: Vec<i64> = args.iter().filter_map(|a| a.parse().ok()).collect();
    let (first, last, step) = match numbers.len() {
        1 => (1, numbers[0], 1),
        2 => (numbers[0], numbers[1], 1),
        3 => (numbers[0], numbers[2], numbers[1]),
        _ => {
            ctx.host.fd_write(2, b"seq: missing operand\n").await?;
            return Ok(1);
        }
    };
    if step == 0 {
        ctx.host.fd_write(2, b"seq: zero increment\n").await?;
        return Ok(1);
    }
    let mut i = first;
    while (step > 0 && i <= last) || (step < 0 && i >= last) {
        // One write per line so a consumer hanging up is observed after
        // a bounded number of bytes, not after the whole sequence.
        let line = format!("{}\n", i);
        match ctx.host.fd_write(1, line.as_bytes()).await {
            Ok(_) => {}
            Err(SyscallError::BrokenPipe) => return Ok(EXIT_EPIPE),
            Err(err) => return Err(err),
        }
        i += step;
    }
    Ok(0)
}

pub fn yes(ctx: GuestCtx) -> ProgFut {
    Box::pin(async move {
        let args = &ctx.host.args()[1..];
        let word = if args.is_empty() {
            "y".to_string()
        } else {
            args.join(" ")
        };
        let line = format!("{}\n", word);
        loop {
            match ctx.host.fd_write(1, line.as_bytes()).await {
                Ok(_) => {}
                Err(SyscallError::BrokenPipe) => return EXIT_EPIPE,
                Err(err) => return fail(&ctx, "yes", err).await,
            }
        }
    })
}

pub fn sleep(ctx: GuestCtx) -> ProgFut {
    Box::pin(async move {
        let args = &ctx.host.args()[1..];
        let Some(seconds) = args.first().and_then(|a| a.parse::<f64>().ok()) else {
            let _ = ctx.host.fd_write(2, b"sleep: invalid time interval\n").await;
            return 1;
        };
        let ms = (seconds * 1000.0).max(0.0) as u64;
        ctx.kernel.sleep(ms).await;
        match ctx.host.check_cancel() {
            Ok(()) => 0,
            Err(err) => fail(&ctx, "sleep", err).await,
        }
    })
}

pub fn env(ctx: GuestCtx) -> ProgFut {
    Box::pin(async move {
        let mut out = String::new();
        for (key, value) in ctx.host.env() {
            out.push_str(&format!("{}={}\n", key, value));
        }
        match write_stdout(&ctx, out.as_bytes()).await {
            Ok(()) => 0,
            Err(err) => fail(&ctx, "env", err).await,
        }
    })
}

pub fn pwd(ctx: GuestCtx) -> ProgFut {
    Box::pin(async move {
        let out = format!("{}\n", ctx.host.cwd());
        match write_stdout(&ctx, out.as_bytes()).await {
            Ok(()) => 0,
            Err(err) => fail(&ctx, "pwd", err).await,
        }
    })
}

pub fn true_prog(_ctx: GuestCtx) -> ProgFut {
    Box::pin(async { 0 })
}

pub fn false_prog(_ctx: GuestCtx) -> ProgFut {
    Box::pin(async { 1 })
}

#[cfg(test)]
mod tests {
    use crate::programs::testutil::bench;

    #[test]
    fn test_echo() {
        let bench = bench();
        assert_eq!(bench.run("echo", &["hello", "world"], b""), 0);
        assert_eq!(bench.stdout_str(), "hello world\n");
    }

    #[test]
    fn test_echo_n() {
        let bench = bench();
        bench.run("echo", &["-n", "x"], b"");
        assert_eq!(bench.stdout_str(), "x");
    }

    #[test]
    fn test_seq_single_bound() {
        let bench = bench();
        assert_eq!(bench.run("seq", &["3"], b""), 0);
        assert_eq!(bench.stdout_str(), "1\n2\n3\n");
    }

    #[test]
    fn test_seq_range_and_step() {
        let bench = bench();
        bench.run("seq", &["2", "2", "8"], b"");
        assert_eq!(bench.stdout_str(), "2\n4\n6\n8\n");
    }

    #[test]
    fn test_true_false() {
        let bench = bench();
        assert_eq!(bench.run("true", &[], b""), 0);
        assert_eq!(bench.run("false", &[], b""), 1);
    }

    #[test]
    fn test_pwd() {
        let bench = bench();
        bench.run("pwd", &[], b"");
        assert_eq!(bench.stdout_str(), "/home/user\n");
    }

    #[test]
    fn test_sleep_completes() {
        let bench = bench();
        assert_eq!(bench.run("sleep", &["0.05"], b""), 0);
    }
}
