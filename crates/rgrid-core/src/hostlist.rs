//! Hostlist（ホスト名の順序列、bracket range 圧縮つき）
//!
//! `node[0-3,5],login0` のような RFC29 風の表記と相互変換する。順序と
//! 重複を保持し、`count`/`nth`/`find` は挿入順に従う。decode → encode は
//! 正しい入力に対して lossless（連続 range は圧縮される）。

use std::fmt;

use thiserror::Error;

/// Hostlist 操作のエラー
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostlistError {
    /// decode に失敗した（不正なトークンを含む）
    #[error("invalid hostlist '{0}'")]
    InvalidFormat(String),
}

/// 数値 suffix の range
///
/// `width > 0` のときゼロ詰め幅を保持する（`n[00-03]` 等）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NumRange {
    lo: u64,
    hi: u64,
    width: usize,
}

impl NumRange {
    fn len(&self) -> usize {
        (self.hi - self.lo + 1) as usize
    }

    fn format(&self, n: u64) -> String {
        if self.width > 0 {
            format!("{n:0width$}", width = self.width)
        } else {
            n.to_string()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HostRange {
    prefix: String,
    /// None は数値 suffix を持たない裸のホスト名
    suffix: Option<NumRange>,
}

impl HostRange {
    fn len(&self) -> usize {
        match &self.suffix {
            Some(r) => r.len(),
            None => 1,
        }
    }

    fn nth(&self, i: usize) -> String {
        match &self.suffix {
            Some(r) => format!("{}{}", self.prefix, r.format(r.lo + i as u64)),
            None => self.prefix.clone(),
        }
    }
}

/// ホスト名の順序列（重複許容）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hostlist {
    ranges: Vec<HostRange>,
}

impl Hostlist {
    /// 空の hostlist を生成
    pub fn new() -> Hostlist {
        Hostlist { ranges: Vec::new() }
    }

    /// hostlist 表記をデコード
    ///
    /// 裸の名前、`name[a-b,c]`、カンマ区切りの併記を受け付ける。
    pub fn decode(s: &str) -> Result<Hostlist, HostlistError> {
        let mut hl = Hostlist::new();
        if s.trim().is_empty() {
            return Ok(hl);
        }
        hl.append(s)?;
        Ok(hl)
    }

    /// hostlist 表記を末尾に追加
    pub fn append(&mut self, s: &str) -> Result<(), HostlistError> {
        for tok in split_toplevel(s) {
            let tok = tok.trim();
            if tok.is_empty() {
                return Err(HostlistError::InvalidFormat(s.to_string()));
            }
            self.append_token(tok)
                .map_err(|_| HostlistError::InvalidFormat(s.to_string()))?;
        }
        Ok(())
    }

    /// 単一ホスト名を末尾に追加
    pub fn append_host(&mut self, host: &str) -> Result<(), HostlistError> {
        if host.is_empty() || host.contains([',', '[', ']']) {
            return Err(HostlistError::InvalidFormat(host.to_string()));
        }
        self.push_range(parse_bare(host));
        Ok(())
    }

    /// 別の hostlist を末尾に連結
    pub fn append_list(&mut self, other: &Hostlist) {
        for r in &other.ranges {
            self.push_range(r.clone());
        }
    }

    fn append_token(&mut self, tok: &str) -> Result<(), ()> {
        match tok.find('[') {
            Some(open) => {
                if !tok.ends_with(']') {
                    return Err(());
                }
                let prefix = &tok[..open];
                let body = &tok[open + 1..tok.len() - 1];
                if body.is_empty() {
                    return Err(());
                }
                for item in body.split(',') {
                    let r = parse_num_range(item).ok_or(())?;
                    self.push_range(HostRange {
                        prefix: prefix.to_string(),
                        suffix: Some(r),
                    });
                }
                Ok(())
            }
            None => {
                if tok.contains(']') {
                    return Err(());
                }
                self.push_range(parse_bare(tok));
                Ok(())
            }
        }
    }

    /// 末尾 range と連続していればマージして push
    fn push_range(&mut self, r: HostRange) {
        if let (Some(last), Some(nr)) = (self.ranges.last_mut(), r.suffix)
            && last.prefix == r.prefix
            && let Some(lr) = &mut last.suffix
            && lr.width == nr.width
            && lr.hi + 1 == nr.lo
        {
            lr.hi = nr.hi;
            return;
        }
        self.ranges.push(r);
    }

    /// ホスト数
    pub fn count(&self) -> usize {
        self.ranges.iter().map(HostRange::len).sum()
    }

    /// 空かどうか
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// 挿入順で n 番目（0-indexed）のホスト名
    pub fn nth(&self, mut n: usize) -> Option<String> {
        for r in &self.ranges {
            if n < r.len() {
                return Some(r.nth(n));
            }
            n -= r.len();
        }
        None
    }

    /// ホスト名の最初の出現位置
    pub fn find(&self, host: &str) -> Option<usize> {
        let target = parse_bare(host);
        let mut base = 0;
        for r in &self.ranges {
            if r.prefix == target.prefix {
                match (&r.suffix, &target.suffix) {
                    (None, None) => return Some(base),
                    (Some(rr), Some(tr))
                        if tr.lo >= rr.lo && tr.lo <= rr.hi && rr.format(tr.lo) == host[r.prefix.len()..] =>
                    {
                        return Some(base + (tr.lo - rr.lo) as usize);
                    }
                    _ => {}
                }
            }
            base += r.len();
        }
        None
    }

    /// 圧縮された hostlist 表記にエンコード
    pub fn encode(&self) -> String {
        let mut out = String::new();
        let mut i = 0;
        while i < self.ranges.len() {
            let r = &self.ranges[i];
            if !out.is_empty() {
                out.push(',');
            }
            match &r.suffix {
                None => {
                    out.push_str(&r.prefix);
                    i += 1;
                }
                Some(_) => {
                    // 同じ prefix / width の連続 range をひとつの bracket group に
                    let mut group: Vec<NumRange> = Vec::new();
                    let width = r.suffix.as_ref().map(|s| s.width).unwrap_or(0);
                    while i < self.ranges.len()
                        && self.ranges[i].prefix == r.prefix
                        && self.ranges[i]
                            .suffix
                            .as_ref()
                            .is_some_and(|s| s.width == width)
                    {
                        group.push(*self.ranges[i].suffix.as_ref().unwrap());
                        i += 1;
                    }
                    if group.len() == 1 && group[0].lo == group[0].hi {
                        out.push_str(&r.prefix);
                        out.push_str(&group[0].format(group[0].lo));
                    } else {
                        out.push_str(&r.prefix);
                        out.push('[');
                        for (k, g) in group.iter().enumerate() {
                            if k > 0 {
                                out.push(',');
                            }
                            if g.lo == g.hi {
                                out.push_str(&g.format(g.lo));
                            } else {
                                out.push_str(&g.format(g.lo));
                                out.push('-');
                                out.push_str(&g.format(g.hi));
                            }
                        }
                        out.push(']');
                    }
                }
            }
        }
        out
    }

    /// 挿入順イテレータ
    pub fn iter(&self) -> impl Iterator<Item = String> + '_ {
        self.ranges.iter().flat_map(|r| (0..r.len()).map(|i| r.nth(i)))
    }
}

impl fmt::Display for Hostlist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl std::str::FromStr for Hostlist {
    type Err = HostlistError;

    fn from_str(s: &str) -> Result<Hostlist, HostlistError> {
        Hostlist::decode(s)
    }
}

/// トップレベル（bracket の外）のカンマで分割
fn split_toplevel(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&s[start..]);
    out
}

/// 裸のホスト名を prefix + 数値 suffix に分解
fn parse_bare(host: &str) -> HostRange {
    let digits_at = host
        .rfind(|c: char| !c.is_ascii_digit())
        .map(|i| i + host[i..].chars().next().map(char::len_utf8).unwrap_or(1))
        .unwrap_or(0);
    let (prefix, digits) = host.split_at(digits_at);
    if digits.is_empty() {
        return HostRange {
            prefix: host.to_string(),
            suffix: None,
        };
    }
    match digits.parse::<u64>() {
        Ok(n) => HostRange {
            prefix: prefix.to_string(),
            suffix: Some(NumRange {
                lo: n,
                hi: n,
                width: pad_width(digits),
            }),
        },
        // u64 に収まらない数字列は suffix 扱いしない
        Err(_) => HostRange {
            prefix: host.to_string(),
            suffix: None,
        },
    }
}

/// `lo(-hi)` をパース
fn parse_num_range(item: &str) -> Option<NumRange> {
    let item = item.trim();
    let (lo_s, hi_s) = match item.split_once('-') {
        Some((a, b)) => (a, b),
        None => (item, item),
    };
    if lo_s.is_empty()
        || hi_s.is_empty()
        || !lo_s.bytes().all(|b| b.is_ascii_digit())
        || !hi_s.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    let lo: u64 = lo_s.parse().ok()?;
    let hi: u64 = hi_s.parse().ok()?;
    if lo > hi {
        return None;
    }
    Some(NumRange {
        lo,
        hi,
        width: pad_width(lo_s),
    })
}

/// ゼロ詰め幅。`07` → 2、`7` → 0
fn pad_width(s: &str) -> usize {
    if s.len() > 1 && s.starts_with('0') {
        s.len()
    } else {
        0
    }
}
