//! エンジンの診断出力（stderr）から解析情報を拾い、チャット用の要約にする
//!
//! エンジン系統ごとに行の書式が違うため、[`Family`] をキーにした
//! 正規表現と抽出関数の表で振り分ける。状態は持たない。

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use rgo_gtp::{Move, encode_compact};

use crate::protocol::{AnalysisChat, AnalysisMarks};

/// 解析行の書式を決めるエンジン系統
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    #[default]
    None,
    Katago,
    LeelaZero,
    Sai,
    Leela,
}

/// 1行から得られた解析の要約
#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    pub visits: u64,
    /// 勝率（%）
    pub winrate: f64,
    /// 目数差の推定（対応するエンジンのみ）
    pub score: Option<f64>,
    /// 読み筋（エンジン表記）
    pub pv: Vec<String>,
}

impl Analysis {
    pub fn summary(&self) -> String {
        match self.score {
            Some(score) => format!(
                "Visits: {}, Winrate: {:.2}%, Score: {:.1}",
                self.visits, self.winrate, score
            ),
            None => format!("Visits: {}, Winrate: {:.2}%", self.visits, self.winrate),
        }
    }

    /// `from` 手目からの読み筋としてチャットペイロードにする。
    ///
    /// 読み筋が空、または盤外の座標を含む場合は `None`。
    pub fn to_chat(&self, from: usize, width: usize, height: usize) -> Option<AnalysisChat> {
        let moves: Vec<Move> = self
            .pv
            .iter()
            .map(|t| Move::from_engine(t, width, height))
            .collect::<Result<_, _>>()
            .ok()?;
        let first = moves.first()?.to_server().ok()?;
        let encoded = encode_compact(&moves).ok()?;
        Some(AnalysisChat {
            kind: "analysis".to_string(),
            name: self.summary(),
            from,
            moves: encoded,
            marks: AnalysisMarks { circle: first },
        })
    }
}

type Extract = fn(&Captures<'_>) -> Option<Analysis>;

struct Strategy {
    family: Family,
    regex: Regex,
    extract: Extract,
}

static STRATEGIES: LazyLock<Vec<Strategy>> = LazyLock::new(|| {
    let table: [(Family, &str, Extract); 4] = [
        (
            Family::Katago,
            r"^CHAT:Visits (\d+) Winrate (\d+(?:\.\d+)?)% ScoreLead (-?\d+(?:\.\d+)?) ScoreStdev (-?\d+(?:\.\d+)?)(?: \(PDA -?\d+(?:\.\d+)?\))? PV (.*)$",
            |c| {
                Some(Analysis {
                    visits: c.get(1)?.as_str().parse().ok()?,
                    winrate: c.get(2)?.as_str().parse().ok()?,
                    score: c.get(3)?.as_str().parse().ok(),
                    pv: split_pv(c.get(5)?.as_str()),
                })
            },
        ),
        (
            Family::LeelaZero,
            r"^\s*(?:[A-Z]\d+|pass) ->\s+(\d+) \(V:\s+(\d+\.\d+)%\) \(LCB:\s+-?\d+\.\d+%\) \(N:\s+\d+\.\d+%\) PV: (.*)$",
            |c| {
                Some(Analysis {
                    visits: c.get(1)?.as_str().parse().ok()?,
                    winrate: c.get(2)?.as_str().parse().ok()?,
                    score: None,
                    pv: split_pv(c.get(3)?.as_str()),
                })
            },
        ),
        (
            Family::Sai,
            r"^\s*(?:[A-Z]\d+|pass) ->\s+(\d+) \(V:\s+(\d+\.\d+)%\) \(LCB:\s+-?\d+\.\d+%\) \(N:\s+\d+\.\d+%\) \(A:\s+(-?\d+\.\d+)\) PV: (.*)$",
            |c| {
                Some(Analysis {
                    visits: c.get(1)?.as_str().parse().ok()?,
                    winrate: c.get(2)?.as_str().parse().ok()?,
                    score: c.get(3)?.as_str().parse().ok(),
                    pv: split_pv(c.get(4)?.as_str()),
                })
            },
        ),
        (
            Family::Leela,
            r"^\s*(?:[A-Z]\d+|pass) ->\s+(\d+) \(W:\s+(\d+\.\d+)%\) .*PV: (.*)$",
            |c| {
                Some(Analysis {
                    visits: c.get(1)?.as_str().parse().ok()?,
                    winrate: c.get(2)?.as_str().parse().ok()?,
                    score: None,
                    pv: split_pv(c.get(3)?.as_str()),
                })
            },
        ),
    ];
    table
        .into_iter()
        .filter_map(|(family, pattern, extract)| match Regex::new(pattern) {
            Ok(regex) => Some(Strategy {
                family,
                regex,
                extract,
            }),
            Err(e) => {
                log::error!("invalid commentary pattern for {family:?}: {e}");
                None
            }
        })
        .collect()
});

fn split_pv(s: &str) -> Vec<String> {
    s.split_whitespace().map(str::to_string).collect()
}

/// `family` の書式で1行を解析する。該当しなければ `None`。
pub fn parse_line(family: Family, line: &str) -> Option<Analysis> {
    if family == Family::None {
        return None;
    }
    let line = line.trim_end();
    STRATEGIES
        .iter()
        .filter(|s| s.family == family)
        .find_map(|s| s.regex.captures(line).and_then(|c| (s.extract)(&c)))
}
