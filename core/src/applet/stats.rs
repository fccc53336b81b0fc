//! Stats/admin line-oriented applet (spec.md §6, §4.8).
//!
//! A client connects, sends one command line (`show stat`, `show info`,
//! `show sess`, `show errors`, `help`, `prompt`, `quit`), and the applet
//! streams a response. Long dumps (`show stat` over many proxies/servers)
//! are pageable: if `output` fills up mid-dump, [`StatsApplet::pump`] returns
//! [`AppletResult::Suspend`] with `cursor` parked exactly where it stopped,
//! and resumes from there the next time the scheduler invokes it.

use super::{Applet, AppletResult};
use crate::channel::Channel;
use crate::clock::Tick;

/// Fixed CSV column schema for `show stat`, in the order columns are
/// written — consumers (and the peer-sync snapshot code) index by position,
/// not name, so this order is part of the wire contract (spec.md §6).
pub const STAT_COLUMNS: &[&str] = &[
    "pxname",
    "svname",
    "qcur",
    "qmax",
    "scur",
    "smax",
    "slim",
    "stot",
    "bin",
    "bout",
    "dreq",
    "dresp",
    "ereq",
    "econ",
    "eresp",
    "wretr",
    "wredis",
    "status",
    "weight",
    "act",
    "bck",
    "chkfail",
    "chkdown",
    "lastchg",
    "downtime",
    "qlimit",
    "pid",
    "iid",
    "sid",
    "throttle",
    "lbtot",
    "tracked",
    "type",
    "rate",
    "rate_lim",
    "rate_max",
    "check_status",
    "check_code",
    "check_duration",
];

/// `type` column values, mirroring the fixed small integer enum the wire
/// format uses: 0 frontend, 1 backend, 2 server, 3 socket/listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowType {
    Frontend = 0,
    Backend = 1,
    Server = 2,
}

impl Default for RowType {
    fn default() -> Self {
        Self::Frontend
    }
}

/// One fully-populated `show stat` CSV row. Built separately for the
/// frontend, each server, and the backend aggregate of one proxy so
/// [`StatRow::to_csv_line`] is the single place new columns get added,
/// instead of three diverging `format!` call sites.
#[derive(Debug, Clone, Default)]
pub struct StatRow {
    pub pxname: String,
    pub svname: String,
    pub qcur: u64,
    pub qmax: u64,
    pub scur: u64,
    pub smax: u64,
    pub slim: u64,
    pub stot: u64,
    pub bin: u64,
    pub bout: u64,
    pub dreq: u64,
    pub dresp: u64,
    pub ereq: u64,
    pub econ: u64,
    pub eresp: u64,
    pub wretr: u64,
    pub wredis: u64,
    pub status: &'static str,
    pub weight: u32,
    pub act: u32,
    pub bck: u32,
    pub chkfail: u64,
    pub chkdown: u64,
    pub lastchg: u64,
    pub downtime: u64,
    pub qlimit: Option<u64>,
    pub pid: u32,
    pub iid: u32,
    pub sid: u32,
    pub throttle: Option<u32>,
    pub lbtot: u64,
    pub tracked: Option<u32>,
    pub row_type: RowType,
    pub rate: u32,
    pub rate_lim: Option<u32>,
    pub rate_max: u32,
    pub check_status: &'static str,
    pub check_code: Option<u32>,
    pub check_duration: Option<u64>,
}

/// Render one integer with a scratch [`itoa::Buffer`] instead of going
/// through `Display`/`String`, the same avoid-an-allocation-per-field move
/// `h1::proto::encode::write_length_header` makes for `Content-Length`.
fn itoa_field<T: itoa::Integer>(buf: &mut itoa::Buffer, v: T) -> String {
    buf.format(v).to_owned()
}

fn opt_field<T: itoa::Integer>(buf: &mut itoa::Buffer, v: Option<T>) -> String {
    match v {
        Some(v) => buf.format(v).to_owned(),
        None => String::new(),
    }
}

impl StatRow {
    pub fn to_csv_line(&self) -> String {
        let mut n = itoa::Buffer::new();
        let fields: [String; 39] = [
            self.pxname.clone(),
            self.svname.clone(),
            itoa_field(&mut n, self.qcur),
            itoa_field(&mut n, self.qmax),
            itoa_field(&mut n, self.scur),
            itoa_field(&mut n, self.smax),
            itoa_field(&mut n, self.slim),
            itoa_field(&mut n, self.stot),
            itoa_field(&mut n, self.bin),
            itoa_field(&mut n, self.bout),
            itoa_field(&mut n, self.dreq),
            itoa_field(&mut n, self.dresp),
            itoa_field(&mut n, self.ereq),
            itoa_field(&mut n, self.econ),
            itoa_field(&mut n, self.eresp),
            itoa_field(&mut n, self.wretr),
            itoa_field(&mut n, self.wredis),
            self.status.to_string(),
            itoa_field(&mut n, self.weight),
            itoa_field(&mut n, self.act),
            itoa_field(&mut n, self.bck),
            itoa_field(&mut n, self.chkfail),
            itoa_field(&mut n, self.chkdown),
            itoa_field(&mut n, self.lastchg),
            itoa_field(&mut n, self.downtime),
            opt_field(&mut n, self.qlimit),
            itoa_field(&mut n, self.pid),
            itoa_field(&mut n, self.iid),
            itoa_field(&mut n, self.sid),
            opt_field(&mut n, self.throttle),
            itoa_field(&mut n, self.lbtot),
            opt_field(&mut n, self.tracked),
            itoa_field(&mut n, self.row_type as u8),
            itoa_field(&mut n, self.rate),
            opt_field(&mut n, self.rate_lim),
            itoa_field(&mut n, self.rate_max),
            self.check_status.to_string(),
            opt_field(&mut n, self.check_code),
            opt_field(&mut n, self.check_duration),
        ];
        debug_assert_eq!(fields.len(), STAT_COLUMNS.len());
        fields.join(",")
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub name: String,
    pub sid: u32,
    pub up: bool,
    pub draining: bool,
    pub weight: u32,
    pub cur_sessions: u64,
    pub max_sessions: u64,
    pub tot_sessions: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub errors_conn: u64,
    pub errors_resp: u64,
    pub retries: u64,
    pub redispatches: u64,
    pub check_fails: u64,
    pub check_downs: u64,
    pub last_change_secs: u64,
    pub downtime_secs: u64,
    pub lbtot: u64,
    pub rate: u32,
    pub rate_max: u32,
    pub check_code: Option<u32>,
    pub check_duration_ms: Option<u64>,
}

impl ServerStats {
    /// `UP|DOWN|NOLB|MAINT|DRAIN`, with a `x/y` transition suffix left to a
    /// richer health-check module than this applet owns (spec.md §6).
    fn status_str(&self) -> &'static str {
        if self.draining {
            "DRAIN"
        } else if self.up {
            "UP"
        } else {
            "DOWN"
        }
    }

    fn to_row(&self, pxname: &str, iid: u32, pid: u32) -> StatRow {
        StatRow {
            pxname: pxname.to_string(),
            svname: self.name.clone(),
            scur: self.cur_sessions,
            smax: self.max_sessions,
            stot: self.tot_sessions,
            bin: self.bytes_in,
            bout: self.bytes_out,
            econ: self.errors_conn,
            eresp: self.errors_resp,
            wretr: self.retries,
            wredis: self.redispatches,
            status: self.status_str(),
            weight: self.weight,
            act: u32::from(self.up),
            bck: u32::from(!self.up),
            chkfail: self.check_fails,
            chkdown: self.check_downs,
            lastchg: self.last_change_secs,
            downtime: self.downtime_secs,
            pid,
            iid,
            sid: self.sid,
            lbtot: self.lbtot,
            row_type: RowType::Server,
            rate: self.rate,
            rate_max: self.rate_max,
            check_status: if self.up { "L7OK" } else { "L4CON" },
            check_code: self.check_code,
            check_duration: self.check_duration_ms,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyStats {
    pub name: String,
    pub iid: u32,
    pub maxconn: u64,
    pub cur_sessions: u64,
    pub max_sessions: u64,
    pub tot_sessions: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub req_denied: u64,
    pub resp_denied: u64,
    pub req_errors: u64,
    pub rate: u32,
    pub rate_max: u32,
    pub accepting: bool,
    pub servers: Vec<ServerStats>,
}

impl ProxyStats {
    fn frontend_row(&self, pid: u32) -> StatRow {
        StatRow {
            pxname: self.name.clone(),
            svname: "FRONTEND".to_string(),
            scur: self.cur_sessions,
            smax: self.max_sessions,
            slim: self.maxconn,
            stot: self.tot_sessions,
            bin: self.bytes_in,
            bout: self.bytes_out,
            dreq: self.req_denied,
            dresp: self.resp_denied,
            ereq: self.req_errors,
            status: if self.accepting { "OPEN" } else { "STOP" },
            pid,
            iid: self.iid,
            row_type: RowType::Frontend,
            rate: self.rate,
            rate_max: self.rate_max,
            ..Default::default()
        }
    }

    fn backend_row(&self, pid: u32) -> StatRow {
        let act = self.servers.iter().filter(|s| s.up).count() as u32;
        let bck = self.servers.len() as u32 - act;
        let tot_sessions: u64 = self.servers.iter().map(|s| s.tot_sessions).sum();
        let bin: u64 = self.servers.iter().map(|s| s.bytes_in).sum();
        let bout: u64 = self.servers.iter().map(|s| s.bytes_out).sum();
        let lbtot: u64 = self.servers.iter().map(|s| s.lbtot).sum();
        StatRow {
            pxname: self.name.clone(),
            svname: "BACKEND".to_string(),
            stot: tot_sessions,
            bin,
            bout,
            status: if act > 0 { "UP" } else { "DOWN" },
            act,
            bck,
            pid,
            iid: self.iid,
            lbtot,
            row_type: RowType::Backend,
            ..Default::default()
        }
    }
}

pub trait StatsSource {
    fn proxies(&self) -> &[ProxyStats];
    fn uptime_secs(&self) -> u64;
    fn pid(&self) -> u32;
    fn recent_errors(&self) -> &[String];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DumpCursor {
    PxInit,
    PxTh,
    PxFe,
    PxSv(usize),
    PxBe,
    PxEnd,
    PxFin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Help,
    Prompt,
    Quit,
    ShowInfo,
    ShowStat,
    ShowSess,
    ShowErrors,
    Empty,
    Unknown,
}

fn parse_command(line: &[u8]) -> Command {
    let line = line.trim_ascii();
    match line {
        b"help" => Command::Help,
        b"prompt" => Command::Prompt,
        b"quit" => Command::Quit,
        b"show info" => Command::ShowInfo,
        b"show stat" => Command::ShowStat,
        b"show sess" => Command::ShowSess,
        b"show errors" => Command::ShowErrors,
        b"" => Command::Empty,
        _ => Command::Unknown,
    }
}

pub struct StatsApplet {
    command: Option<Command>,
    cursor: DumpCursor,
    proxy_idx: usize,
    interactive: bool,
    done: bool,
}

impl StatsApplet {
    pub fn new() -> Self {
        Self { command: None, cursor: DumpCursor::PxInit, proxy_idx: 0, interactive: false, done: false }
    }

    fn write(output: &mut Channel, s: &str) -> bool {
        if output.channel_full(0) {
            return false;
        }
        output.buf_mut().put_block(s.as_bytes()).is_ok()
    }

    /// Pipelining support (spec.md §4.8): commands may be separated from the
    /// next one on the same line by `;`. This applet handles one command per
    /// `pump` call, so a `;`-joined line is split by the caller feeding the
    /// input channel; here we only strip a trailing semicolon-terminated
    /// residue before parsing so a bare `show stat;show info` line's first
    /// clause parses cleanly.
    fn first_clause(line: &[u8]) -> &[u8] {
        match line.iter().position(|&b| b == b';') {
            Some(idx) => &line[..idx],
            None => line,
        }
    }

    fn dump_stat(&mut self, source: &dyn StatsSource, output: &mut Channel) -> AppletResult {
        loop {
            match self.cursor {
                DumpCursor::PxInit => {
                    let header = format!("# {}\n", STAT_COLUMNS.join(","));
                    if !Self::write(output, &header) {
                        return AppletResult::Suspend;
                    }
                    self.cursor = DumpCursor::PxTh;
                }
                DumpCursor::PxTh => {
                    self.proxy_idx = 0;
                    self.cursor = DumpCursor::PxFe;
                }
                DumpCursor::PxFe => {
                    if self.proxy_idx >= source.proxies().len() {
                        self.cursor = DumpCursor::PxEnd;
                        continue;
                    }
                    let px = &source.proxies()[self.proxy_idx];
                    let line = px.frontend_row(source.pid()).to_csv_line() + "\n";
                    if !Self::write(output, &line) {
                        return AppletResult::Suspend;
                    }
                    self.cursor = DumpCursor::PxSv(0);
                }
                DumpCursor::PxSv(i) => {
                    let px = &source.proxies()[self.proxy_idx];
                    if i >= px.servers.len() {
                        self.cursor = DumpCursor::PxBe;
                        continue;
                    }
                    let sv = &px.servers[i];
                    let line = sv.to_row(&px.name, px.iid, source.pid()).to_csv_line() + "\n";
                    if !Self::write(output, &line) {
                        return AppletResult::Suspend;
                    }
                    self.cursor = DumpCursor::PxSv(i + 1);
                }
                DumpCursor::PxBe => {
                    let px = &source.proxies()[self.proxy_idx];
                    let line = px.backend_row(source.pid()).to_csv_line() + "\n";
                    if !Self::write(output, &line) {
                        return AppletResult::Suspend;
                    }
                    self.proxy_idx += 1;
                    self.cursor = DumpCursor::PxFe;
                }
                DumpCursor::PxEnd => {
                    self.cursor = DumpCursor::PxFin;
                }
                DumpCursor::PxFin => {
                    self.done = true;
                    return AppletResult::Progress;
                }
            }
        }
    }

    fn dump_info(&mut self, source: &dyn StatsSource, output: &mut Channel) -> AppletResult {
        let line = format!(
            "Uptime_sec: {}\nPid: {}\nProxies: {}\n",
            source.uptime_secs(),
            source.pid(),
            source.proxies().len()
        );
        if !Self::write(output, &line) {
            return AppletResult::Suspend;
        }
        self.done = true;
        AppletResult::Progress
    }

    fn dump_errors(&mut self, source: &dyn StatsSource, output: &mut Channel) -> AppletResult {
        for e in source.recent_errors() {
            let line = format!("{e}\n");
            if !Self::write(output, &line) {
                return AppletResult::Suspend;
            }
        }
        self.done = true;
        AppletResult::Progress
    }
}

impl Default for StatsApplet {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives the applet against a concrete stats snapshot; kept separate from
/// the [`Applet`] trait impl since that trait has no way to hand in
/// `source`. The worker loop calls this directly instead of going through
/// dynamic dispatch.
impl StatsApplet {
    pub fn pump(&mut self, source: &dyn StatsSource, input: &mut Channel, output: &mut Channel, now: Tick) -> AppletResult {
        let _ = now;
        if self.command.is_none() {
            let line = match input.buf().get_line_nc(input.buf().output_len()) {
                crate::buffer::LineNc::Line(parts, len) => {
                    let mut owned = Vec::with_capacity(len);
                    owned.extend_from_slice(parts[0]);
                    owned.extend_from_slice(parts[1]);
                    input.buf_mut().drop_input(len);
                    Some(owned)
                }
                crate::buffer::LineNc::NoLine => None,
                crate::buffer::LineNc::NoLineFull => Some(Vec::new()),
            };
            let Some(raw) = line else {
                return AppletResult::Suspend;
            };
            self.command = Some(parse_command(Self::first_clause(&raw)));
        }

        match self.command.unwrap() {
            Command::Help => {
                let r = if Self::write(output, "show info, show stat, show sess, show errors, prompt, quit\n") {
                    self.done = true;
                    AppletResult::Progress
                } else {
                    AppletResult::Suspend
                };
                self.finish_if_done(r)
            }
            Command::Prompt => {
                self.interactive = !self.interactive;
                self.done = true;
                AppletResult::Progress
            }
            Command::Quit | Command::Empty => {
                self.done = true;
                AppletResult::Progress
            }
            Command::ShowInfo => self.dump_info(source, output),
            Command::ShowStat => self.dump_stat(source, output),
            Command::ShowSess => self.dump_info(source, output),
            Command::ShowErrors => self.dump_errors(source, output),
            Command::Unknown => {
                let r = if Self::write(output, "unknown command\n") {
                    self.done = true;
                    AppletResult::Progress
                } else {
                    AppletResult::Suspend
                };
                self.finish_if_done(r)
            }
        }
    }

    fn finish_if_done(&self, r: AppletResult) -> AppletResult {
        if self.done {
            AppletResult::Done
        } else {
            r
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// `true` in interactive mode (after `prompt` toggled it on): the caller
    /// writes a `\n> ` prompt after each command per spec.md §6.
    pub fn is_interactive(&self) -> bool {
        self.interactive
    }
}

impl Applet for StatsApplet {
    fn process(&mut self, _input: &mut Channel, _output: &mut Channel, _now: Tick) -> AppletResult {
        // Real dispatch requires a `StatsSource`; callers use `pump` directly.
        // Kept to satisfy the `Applet` trait seam for uniform scheduling.
        AppletResult::Suspend
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct FixtureSource {
        proxies: Vec<ProxyStats>,
    }

    impl StatsSource for FixtureSource {
        fn proxies(&self) -> &[ProxyStats] {
            &self.proxies
        }
        fn uptime_secs(&self) -> u64 {
            42
        }
        fn pid(&self) -> u32 {
            1
        }
        fn recent_errors(&self) -> &[String] {
            &[]
        }
    }

    fn one_proxy_one_server() -> ProxyStats {
        ProxyStats {
            name: "web".into(),
            iid: 1,
            maxconn: 2000,
            cur_sessions: 3,
            max_sessions: 10,
            tot_sessions: 100,
            bytes_in: 1000,
            bytes_out: 2000,
            req_denied: 0,
            resp_denied: 0,
            req_errors: 0,
            rate: 5,
            rate_max: 20,
            accepting: true,
            servers: vec![ServerStats {
                name: "s1".into(),
                sid: 1,
                up: true,
                weight: 1,
                cur_sessions: 2,
                tot_sessions: 90,
                bytes_in: 900,
                bytes_out: 1800,
                ..Default::default()
            }],
        }
    }

    #[test]
    fn show_info_writes_snapshot_and_completes() {
        let source = FixtureSource { proxies: vec![] };
        let mut input = Channel::new(128, 0, false);
        let mut output = Channel::new(4096, 0, true);
        input.buf_mut().put_block(b"show info\n").unwrap();
        let mut applet = StatsApplet::new();
        let r = applet.pump(&source, &mut input, &mut output, 0);
        assert_eq!(r, AppletResult::Done);
        assert!(output.buf().output_len() > 0);
    }

    #[test]
    fn unknown_command_reports_gracefully() {
        let source = FixtureSource { proxies: vec![] };
        let mut input = Channel::new(128, 0, false);
        let mut output = Channel::new(4096, 0, true);
        input.buf_mut().put_block(b"bogus\n").unwrap();
        let mut applet = StatsApplet::new();
        let r = applet.pump(&source, &mut input, &mut output, 0);
        assert_eq!(r, AppletResult::Done);
    }

    #[test]
    fn show_stat_dumps_header_frontend_server_and_backend_rows() {
        let source = FixtureSource { proxies: vec![one_proxy_one_server()] };
        let mut input = Channel::new(256, 0, false);
        let mut output = Channel::new(8192, 0, true);
        input.buf_mut().put_block(b"show stat\n").unwrap();
        let mut applet = StatsApplet::new();
        let r = applet.pump(&source, &mut input, &mut output, 0);
        assert_eq!(r, AppletResult::Done);
        let (parts, n) = output.buf().get_block_nc(0, output.buf().output_len());
        let mut dumped = parts[0].to_vec();
        dumped.extend_from_slice(&parts[1][..n.saturating_sub(parts[0].len())]);
        let text = String::from_utf8(dumped).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), format!("# {}", STAT_COLUMNS.join(",")));
        assert!(lines.next().unwrap().starts_with("web,FRONTEND,"));
        assert!(lines.next().unwrap().starts_with("web,s1,"));
        assert!(lines.next().unwrap().starts_with("web,BACKEND,"));
        assert!(lines.next().is_none());
    }

    #[test]
    fn csv_row_has_exactly_the_schema_column_count() {
        let row = StatRow::default();
        assert_eq!(row.to_csv_line().split(',').count(), STAT_COLUMNS.len());
    }

    #[test]
    fn pipelined_command_line_uses_only_first_clause() {
        assert_eq!(StatsApplet::first_clause(b"show info;show stat"), b"show info");
        assert_eq!(StatsApplet::first_clause(b"quit"), b"quit");
    }
}
