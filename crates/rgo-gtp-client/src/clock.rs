//! サーバ時計をエンジンの時間管理コマンドに翻訳する
//!
//! GTP が素で表せるのはカナダ式秒読み (`time_settings`) だけなので、
//! それ以外の方式は拡張コマンド（対応していれば）か近似で伝える。
//!
//! | 方式 | 拡張あり | 拡張なし |
//! |---|---|---|
//! | カナダ式 | `kgs-time_settings canadian` | `time_settings` |
//! | 秒読み | `kgs-time_settings byoyomi` | 最後の1回以外を持ち時間に繰り入れたカナダ式 (1手/回) |
//! | フィッシャー | `kata-time_settings fischer-capped` | 加算分を秒読みにしたカナダ式 (1手/回) |
//! | 単純 | - | 持ち時間0・1手/回 |
//! | 切れ負け | - | 秒読み無し |
//!
//! 送る値はすべて0以上に丸め、秒未満は切り捨てる。

use rgo_gtp::Color;

use crate::engine::{Capabilities, EngineSession};
use crate::protocol::{Clock, PeriodClock, TimeControl};

/// 通信路側で測った時計のずれ・遅延（ms）
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClockOffset {
    /// ローカル時刻 - サーバ時刻
    pub drift_ms: f64,
    /// 着手がこちらに届くまでの遅延
    pub latency_ms: f64,
}

/// 翻訳に必要な時刻情報
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockContext {
    /// ローカルの現在時刻（ms, epoch）
    pub local_now_ms: f64,
    pub offset: ClockOffset,
    /// セッション最初の着手でだけ差し引く起動猶予（ms）
    pub startup_buffer_ms: f64,
}

impl ClockContext {
    pub fn now(offset: ClockOffset, startup_buffer_ms: f64) -> Self {
        Self {
            local_now_ms: chrono::Utc::now().timestamp_millis() as f64,
            offset,
            startup_buffer_ms,
        }
    }
}

/// 秒読みの残り。`main > 0` の間は持ち時間中。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ByoyomiLeft {
    pub main: f64,
    /// 現在の1回の残り
    pub period: f64,
    pub periods: u32,
}

/// 持ち時間・秒読みの残りを経過時間ぶん進める。
///
/// 持ち時間を使い切った分は秒読みへ、1回を使い切った分は次の回へ繰り越す。
/// 最後の1回に達したらそれ以上は減らさない。
pub fn roll_byoyomi(side: &PeriodClock, elapsed: f64, period_time: f64) -> ByoyomiLeft {
    let main = side.thinking_time - elapsed;
    if side.thinking_time > 0.0 && main > 0.0 {
        return ByoyomiLeft {
            main,
            period: period_time,
            periods: side.periods,
        };
    }
    let mut periods = side.periods.max(1);
    let mut period = period_time + side.thinking_time.max(0.0) - elapsed;
    if period < 0.0 && periods > 1 && period_time > 0.0 {
        let spent = (-period / period_time).ceil().min(f64::from(periods - 1));
        period += spent * period_time;
        periods -= spent as u32;
    }
    ByoyomiLeft {
        main: 0.0,
        period: period.max(0.0),
        periods,
    }
}

/// カナダ式の残り（秒, 残り手数）
pub fn roll_canadian(side: &PeriodClock, elapsed: f64, period_time: f64, stones: u32) -> (f64, u32) {
    let (mut left, mut moves_left) = if side.thinking_time > 0.0 {
        let main = side.thinking_time - elapsed;
        if main > 0.0 {
            return (main, 0);
        }
        (period_time + main, stones)
    } else if side.moves_left == 0 {
        // 秒読みに入った直後でブロックがまだ設定されていない
        (period_time - elapsed, stones)
    } else {
        (side.block_time - elapsed, side.moves_left)
    };
    if left < 0.0 && period_time > 0.0 {
        left = left.rem_euclid(period_time);
        moves_left = stones;
    }
    (left.max(0.0), moves_left)
}

/// 送信用の秒数（0以上・切り捨て）
fn secs(v: f64) -> i64 {
    if v.is_finite() && v > 0.0 { v.floor() as i64 } else { 0 }
}

/// 時間管理コマンドの列を組み立てる。未対応の方式では空。
///
/// 順序は設定コマンド、黒の `time_left`、白の `time_left`。
pub fn time_commands(
    tc: &TimeControl,
    clock: &Clock,
    caps: Capabilities,
    ctx: &ClockContext,
) -> Vec<String> {
    let server_now = clock.now.unwrap_or(ctx.local_now_ms - ctx.offset.drift_ms);
    let to_move = clock.color_to_move();
    let elapsed = |color: Color| -> f64 {
        if to_move != Some(color) {
            return 0.0;
        }
        let ms = server_now - clock.last_move + ctx.offset.latency_ms + ctx.startup_buffer_ms;
        ms.max(0.0) / 1000.0
    };
    let colors = [Color::Black, Color::White];
    let mut cmds = Vec::with_capacity(3);

    match *tc {
        TimeControl::Canadian {
            main_time,
            period_time,
            stones_per_period,
            ..
        } => {
            if caps.kgs_time_settings {
                cmds.push(format!(
                    "kgs-time_settings canadian {} {} {}",
                    secs(main_time),
                    secs(period_time),
                    stones_per_period
                ));
            } else {
                cmds.push(format!(
                    "time_settings {} {} {}",
                    secs(main_time),
                    secs(period_time),
                    stones_per_period
                ));
            }
            for c in colors {
                let side = clock.side(c).detailed();
                let (left, stones) = roll_canadian(&side, elapsed(c), period_time, stones_per_period);
                cmds.push(format!("time_left {} {} {}", c, secs(left), stones));
            }
        }
        TimeControl::Byoyomi {
            main_time,
            period_time,
            periods,
            ..
        } => {
            if caps.kgs_time_settings {
                cmds.push(format!(
                    "kgs-time_settings byoyomi {} {} {}",
                    secs(main_time),
                    secs(period_time),
                    periods
                ));
                for c in colors {
                    let left = roll_byoyomi(&clock.side(c).detailed(), elapsed(c), period_time);
                    if left.main > 0.0 {
                        cmds.push(format!("time_left {} {} 0", c, secs(left.main)));
                    } else {
                        cmds.push(format!("time_left {} {} {}", c, secs(left.period), left.periods));
                    }
                }
            } else {
                // 最後の1回だけを秒読みとして見せ、残りの回は持ち時間に含める
                let folded = main_time + f64::from(periods.saturating_sub(1)) * period_time;
                cmds.push(format!("time_settings {} {} 1", secs(folded), secs(period_time)));
                for c in colors {
                    let left = roll_byoyomi(&clock.side(c).detailed(), elapsed(c), period_time);
                    let total = if left.main > 0.0 {
                        left.main + f64::from(left.periods) * period_time
                    } else {
                        left.period + f64::from(left.periods.saturating_sub(1)) * period_time
                    };
                    let main = total - period_time;
                    if main > 0.0 {
                        cmds.push(format!("time_left {} {} 0", c, secs(main)));
                    } else {
                        cmds.push(format!("time_left {} {} 1", c, secs(total)));
                    }
                }
            }
        }
        TimeControl::Fischer {
            initial_time,
            time_increment,
            max_time,
            ..
        } => {
            if caps.kata_fischer {
                cmds.push(format!(
                    "kata-time_settings fischer-capped {} {} {} -1",
                    secs(initial_time),
                    secs(time_increment),
                    secs(max_time)
                ));
                for c in colors {
                    let left = clock.side(c).detailed().thinking_time - elapsed(c);
                    cmds.push(format!("time_left {} {} 0", c, secs(left)));
                }
            } else {
                // 加算分を1手1回の秒読みとみなし、その分を持ち時間から引いて使い過ぎを防ぐ
                cmds.push(format!(
                    "time_settings {} {} 1",
                    secs(initial_time - time_increment),
                    secs(time_increment)
                ));
                for c in colors {
                    let main = clock.side(c).detailed().thinking_time - elapsed(c) - time_increment;
                    if main > 0.0 {
                        cmds.push(format!("time_left {} {} 0", c, secs(main)));
                    } else {
                        cmds.push(format!("time_left {} {} 1", c, secs(time_increment + main)));
                    }
                }
            }
        }
        TimeControl::Simple { per_move, .. } => {
            cmds.push(format!("time_settings 0 {} 1", secs(per_move)));
            for c in colors {
                cmds.push(format!("time_left {} {} 1", c, secs(per_move - elapsed(c))));
            }
        }
        TimeControl::Absolute { total_time, .. } => {
            cmds.push(format!("time_settings {} 0 0", secs(total_time)));
            for c in colors {
                let left = clock.side(c).detailed().thinking_time - elapsed(c);
                cmds.push(format!("time_left {} {} 0", c, secs(left)));
            }
        }
        TimeControl::None => {}
    }
    cmds
}

/// 時間管理コマンドを応答を待たずに送る。送ったコマンド数を返す。
pub fn send_clock(
    session: &EngineSession,
    tc: &TimeControl,
    clock: &Clock,
    ctx: &ClockContext,
) -> usize {
    let cmds = time_commands(tc, clock, session.capabilities(), ctx);
    for cmd in &cmds {
        session.fire(cmd);
    }
    cmds.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ClockSide, Speed};

    const NOW: f64 = 1_700_000_000_000.0;
    const BLACK: u64 = 1;
    const WHITE: u64 = 2;

    fn clock(to_move: u64, elapsed_ms: f64, black: PeriodClock, white: PeriodClock) -> Clock {
        Clock {
            game_id: 1,
            current_player: to_move,
            black_player_id: BLACK,
            white_player_id: WHITE,
            last_move: NOW - elapsed_ms,
            now: None,
            expiration: None,
            black_time: ClockSide::Detailed(black),
            white_time: ClockSide::Detailed(white),
            pause: None,
        }
    }

    fn ctx() -> ClockContext {
        ClockContext {
            local_now_ms: NOW,
            offset: ClockOffset::default(),
            startup_buffer_ms: 0.0,
        }
    }

    fn main_only(t: f64) -> PeriodClock {
        PeriodClock {
            thinking_time: t,
            ..Default::default()
        }
    }

    fn byo(thinking: f64, periods: u32, period_time: f64) -> PeriodClock {
        PeriodClock {
            thinking_time: thinking,
            periods,
            period_time,
            ..Default::default()
        }
    }

    fn all_controls() -> Vec<TimeControl> {
        vec![
            TimeControl::Canadian {
                main_time: 60.0,
                period_time: 30.0,
                stones_per_period: 5,
                speed: Speed::Live,
            },
            TimeControl::Byoyomi {
                main_time: 0.0,
                period_time: 30.0,
                periods: 5,
                speed: Speed::Live,
            },
            TimeControl::Fischer {
                initial_time: 120.0,
                time_increment: 10.0,
                max_time: 300.0,
                speed: Speed::Blitz,
            },
            TimeControl::Simple {
                per_move: 20.0,
                speed: Speed::Blitz,
            },
            TimeControl::Absolute {
                total_time: 600.0,
                speed: Speed::Live,
            },
        ]
    }

    fn numbers(cmd: &str) -> Vec<i64> {
        cmd.split_whitespace().filter_map(|t| t.parse().ok()).collect()
    }

    #[test]
    fn canadian_in_main_time() {
        let tc = &all_controls()[0];
        let c = clock(BLACK, 10_500.0, main_only(60.0), main_only(60.0));
        let cmds = time_commands(tc, &c, Capabilities::default(), &ctx());
        assert_eq!(
            cmds,
            vec!["time_settings 60 30 5", "time_left black 49 0", "time_left white 60 0"]
        );
    }

    #[test]
    fn canadian_in_overtime_reports_block() {
        let tc = &all_controls()[0];
        let over = PeriodClock {
            thinking_time: 0.0,
            moves_left: 3,
            block_time: 25.0,
            ..Default::default()
        };
        let c = clock(WHITE, 5_000.0, main_only(60.0), over);
        let caps = Capabilities {
            kgs_time_settings: true,
            kata_fischer: false,
        };
        let cmds = time_commands(tc, &c, caps, &ctx());
        assert_eq!(cmds[0], "kgs-time_settings canadian 60 30 5");
        assert_eq!(cmds[2], "time_left white 20 3");
    }

    #[test]
    fn canadian_main_time_spills_into_first_block() {
        let (left, stones) = roll_canadian(&main_only(10.0), 15.0, 30.0, 5);
        assert_eq!((left, stones), (25.0, 5));
        // 何ブロック分も遅れていても負にならない
        let (left, stones) = roll_canadian(&main_only(10.0), 100.0, 30.0, 5);
        assert_eq!((left, stones), (20.0, 5));
    }

    #[test]
    fn canadian_rollover_is_bounded_for_huge_delays() {
        let (left, stones) = roll_canadian(&main_only(0.0), 1.0e12, 30.0, 5);
        assert!((0.0..30.0).contains(&left), "{left}");
        assert_eq!(stones, 5);
        // 加算では桁落ちで進まなくなる組み合わせ
        let (left, _) = roll_canadian(&main_only(0.0), 1.0e18, 1.0e-3, 5);
        assert!((0.0..=1.0e-3).contains(&left), "{left}");
    }

    #[test]
    fn byoyomi_rolls_into_final_period() {
        let left = roll_byoyomi(&byo(0.0, 5, 30.0), 130.0, 30.0);
        assert_eq!(left.periods, 1);
        assert_eq!(left.period, 20.0);

        let left = roll_byoyomi(&byo(0.0, 5, 30.0), 121.0, 30.0);
        assert_eq!(left.periods, 1);
        assert_eq!(left.period, 29.0);

        // 最後の1回を超えても負にはならない
        let left = roll_byoyomi(&byo(0.0, 5, 30.0), 1_000.0, 30.0);
        assert_eq!(left.periods, 1);
        assert_eq!(left.period, 0.0);

        let left = roll_byoyomi(&byo(0.0, 5, 30.0), 90.0, 30.0);
        assert_eq!(left.periods, 2);
        assert_eq!(left.period, 0.0);

        let left = roll_byoyomi(&byo(0.0, u32::MAX, 30.0), 1.0e9, 30.0);
        assert_eq!(left.periods, u32::MAX - 33_333_333);
        assert_eq!(left.period, 20.0);
    }

    #[test]
    fn byoyomi_main_time_spills_into_periods() {
        let left = roll_byoyomi(&byo(20.0, 5, 30.0), 65.0, 30.0);
        assert_eq!(left.main, 0.0);
        assert_eq!(left.periods, 4);
        assert_eq!(left.period, 15.0);
    }

    #[test]
    fn byoyomi_with_extension() {
        let tc = TimeControl::Byoyomi {
            main_time: 600.0,
            period_time: 30.0,
            periods: 5,
            speed: Speed::Live,
        };
        let caps = Capabilities {
            kgs_time_settings: true,
            kata_fischer: false,
        };
        let c = clock(BLACK, 40_000.0, byo(0.0, 3, 30.0), byo(300.0, 5, 30.0));
        let cmds = time_commands(&tc, &c, caps, &ctx());
        assert_eq!(
            cmds,
            vec![
                "kgs-time_settings byoyomi 600 30 5",
                "time_left black 20 2",
                "time_left white 300 0",
            ]
        );
    }

    #[test]
    fn byoyomi_emulated_as_canadian() {
        let tc = TimeControl::Byoyomi {
            main_time: 600.0,
            period_time: 30.0,
            periods: 5,
            speed: Speed::Live,
        };
        let c = clock(BLACK, 40_000.0, byo(0.0, 3, 30.0), byo(300.0, 5, 30.0));
        let cmds = time_commands(&tc, &c, Capabilities::default(), &ctx());
        // 黒: 残り2回 = 20 + 30 秒 → 最後の1回を除いて持ち時間 20 秒
        // 白: 300 + 5*30 = 450 → 持ち時間 420 秒
        assert_eq!(
            cmds,
            vec!["time_settings 720 30 1", "time_left black 20 0", "time_left white 420 0"]
        );

        let last = clock(BLACK, 10_000.0, byo(0.0, 1, 30.0), byo(300.0, 5, 30.0));
        let cmds = time_commands(&tc, &last, Capabilities::default(), &ctx());
        assert_eq!(cmds[1], "time_left black 20 1");
    }

    #[test]
    fn fischer_forms() {
        let tc = &all_controls()[2];
        let c = clock(BLACK, 5_000.0, main_only(100.0), main_only(8.0));
        let kata = Capabilities {
            kgs_time_settings: false,
            kata_fischer: true,
        };
        assert_eq!(
            time_commands(tc, &c, kata, &ctx()),
            vec![
                "kata-time_settings fischer-capped 120 10 300 -1",
                "time_left black 95 0",
                "time_left white 8 0",
            ]
        );
        assert_eq!(
            time_commands(tc, &c, Capabilities::default(), &ctx()),
            vec!["time_settings 110 10 1", "time_left black 85 0", "time_left white 8 1"]
        );
    }

    #[test]
    fn simple_reports_only_current_ply() {
        let tc = &all_controls()[3];
        let mut c = clock(WHITE, 7_200.0, PeriodClock::default(), PeriodClock::default());
        c.black_time = ClockSide::Deadline(NOW + 20_000.0);
        let cmds = time_commands(tc, &c, Capabilities::default(), &ctx());
        assert_eq!(
            cmds,
            vec!["time_settings 0 20 1", "time_left black 20 1", "time_left white 12 1"]
        );
    }

    #[test]
    fn absolute_has_no_overtime() {
        let tc = &all_controls()[4];
        let c = clock(BLACK, 1_000.0, main_only(500.0), main_only(400.0));
        let cmds = time_commands(tc, &c, Capabilities::default(), &ctx());
        assert_eq!(
            cmds,
            vec!["time_settings 600 0 0", "time_left black 499 0", "time_left white 400 0"]
        );
    }

    #[test]
    fn unsupported_sends_nothing() {
        let c = clock(BLACK, 0.0, main_only(1.0), main_only(1.0));
        assert!(time_commands(&TimeControl::None, &c, Capabilities::default(), &ctx()).is_empty());
    }

    #[test]
    fn startup_buffer_and_offsets_are_applied() {
        let tc = &all_controls()[4];
        let c = clock(BLACK, 1_000.0, main_only(500.0), main_only(400.0));
        let first = ClockContext {
            local_now_ms: NOW + 2_000.0,
            offset: ClockOffset {
                drift_ms: 2_000.0,
                latency_ms: 500.0,
            },
            startup_buffer_ms: 3_000.0,
        };
        let cmds = time_commands(tc, &c, Capabilities::default(), &first);
        // 1.0 + 0.5 + 3.0 秒
        assert_eq!(cmds[1], "time_left black 495 0");

        // サーバ時刻があればそちらを優先する
        let mut with_now = c.clone();
        with_now.now = Some(NOW + 10_000.0);
        let cmds = time_commands(tc, &with_now, Capabilities::default(), &ctx());
        assert_eq!(cmds[1], "time_left black 489 0");
    }

    #[test]
    fn reported_values_never_negative() {
        let caps_list = [
            Capabilities::default(),
            Capabilities {
                kgs_time_settings: true,
                kata_fischer: true,
            },
        ];
        let sides = [
            main_only(0.0),
            main_only(5.0),
            byo(0.0, 0, 30.0),
            byo(3.0, 1, 30.0),
            PeriodClock {
                thinking_time: 0.0,
                moves_left: 2,
                block_time: 3.0,
                ..Default::default()
            },
        ];
        for tc in all_controls() {
            for caps in caps_list {
                for side in sides {
                    for elapsed_ms in [0.0, 999.0, 86_400_000.0, 1.0e12] {
                        let c = clock(BLACK, elapsed_ms, side, side);
                        for cmd in time_commands(&tc, &c, caps, &ctx()) {
                            for n in numbers(&cmd) {
                                if n == -1 && cmd.starts_with("kata-time_settings") {
                                    continue;
                                }
                                assert!(n >= 0, "{cmd} for {tc:?}");
                            }
                        }
                    }
                }
            }
        }
    }
}
