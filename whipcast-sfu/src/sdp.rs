//! Minimal SDP model for WHIP offer/answer exchange
//!
//! Only the lines needed to negotiate a publish are modelled; everything else
//! in an offer is skipped. Parsing accepts LF or CRLF line endings, writing
//! always produces CRLF.

use std::fmt::{self, Write as _};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SdpError {
    #[error("empty session description")]
    Empty,

    #[error("session description must start with v=0")]
    MissingVersion,

    #[error("invalid line {line}: {content}")]
    InvalidLine { line: usize, content: String },

    #[error("invalid m= line: {0}")]
    InvalidMedia(String),

    #[error("invalid a={name} value: {value}")]
    InvalidAttribute { name: String, value: String },
}

fn invalid_attribute(name: &str, value: &str) -> SdpError {
    SdpError::InvalidAttribute {
        name: name.to_string(),
        value: value.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    fn from_attribute(name: &str) -> Option<Self> {
        match name {
            "sendrecv" => Some(Self::SendRecv),
            "sendonly" => Some(Self::SendOnly),
            "recvonly" => Some(Self::RecvOnly),
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SendRecv => "sendrecv",
            Self::SendOnly => "sendonly",
            Self::RecvOnly => "recvonly",
            Self::Inactive => "inactive",
        }
    }

    /// Whether the offering side sends media in this direction
    #[must_use]
    pub const fn is_sending(&self) -> bool {
        matches!(self, Self::SendRecv | Self::SendOnly)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub username: String,
    pub session_id: String,
    pub session_version: String,
    pub address: String,
}

impl Default for Origin {
    fn default() -> Self {
        Self {
            username: "-".to_string(),
            session_id: "0".to_string(),
            session_version: "0".to_string(),
            address: "127.0.0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub algorithm: String,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub semantics: String,
    pub mids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpMap {
    pub payload_type: u8,
    pub encoding: String,
    pub clock_rate: u32,
    pub channels: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fmtp {
    pub payload_type: u8,
    pub config: String,
}

impl Fmtp {
    /// `key=value` pairs of the format parameters; keys without value map to ""
    pub fn params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.config
            .split(';')
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (pair, ""),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpFb {
    /// `None` is the `*` wildcard
    pub payload_type: Option<u8>,
    pub feedback_type: String,
    pub parameter: String,
}

impl RtcpFb {
    #[must_use]
    pub fn applies_to(&self, payload_type: u8) -> bool {
        self.payload_type.map_or(true, |pt| pt == payload_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtMap {
    pub id: u8,
    pub direction: Option<String>,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsrcAttribute {
    pub ssrc: u32,
    pub attribute: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsrcGroup {
    pub semantics: String,
    pub ssrcs: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub foundation: String,
    pub component: u8,
    pub transport: String,
    pub priority: u32,
    pub ip: String,
    pub port: u16,
    pub candidate_type: String,
    pub tcp_type: Option<String>,
}

impl FromStr for Candidate {
    type Err = SdpError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let err = || invalid_attribute("candidate", value);
        let parts: Vec<&str> = value.split_whitespace().collect();
        if parts.len() < 8 || parts[6] != "typ" {
            return Err(err());
        }
        let tcp_type = parts
            .iter()
            .position(|p| *p == "tcptype")
            .and_then(|i| parts.get(i + 1))
            .map(|s| (*s).to_string());

        Ok(Self {
            foundation: parts[0].to_string(),
            component: parts[1].parse().map_err(|_| err())?,
            transport: parts[2].to_string(),
            priority: parts[3].parse().map_err(|_| err())?,
            ip: parts[4].to_string(),
            port: parts[5].parse().map_err(|_| err())?,
            candidate_type: parts[7].to_string(),
            tcp_type,
        })
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.transport,
            self.priority,
            self.ip,
            self.port,
            self.candidate_type
        )?;
        if let Some(tcp_type) = &self.tcp_type {
            write!(f, " tcptype {tcp_type}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    pub media: String,
    pub port: u16,
    pub protocol: String,
    pub formats: Vec<String>,
    pub connection: Option<String>,
    pub mid: Option<String>,
    pub direction: Option<Direction>,
    pub ice_ufrag: Option<String>,
    pub ice_pwd: Option<String>,
    pub ice_options: Option<String>,
    pub fingerprint: Option<Fingerprint>,
    pub setup: Option<String>,
    pub rtcp_mux: bool,
    pub rtcp_rsize: bool,
    pub rtpmaps: Vec<RtpMap>,
    pub fmtps: Vec<Fmtp>,
    pub rtcp_fbs: Vec<RtcpFb>,
    pub extmaps: Vec<ExtMap>,
    pub ssrcs: Vec<SsrcAttribute>,
    pub ssrc_groups: Vec<SsrcGroup>,
    pub candidates: Vec<Candidate>,
    pub end_of_candidates: bool,
}

impl MediaDescription {
    #[must_use]
    pub fn new(media: &str, port: u16, protocol: &str) -> Self {
        Self {
            media: media.to_string(),
            port,
            protocol: protocol.to_string(),
            formats: Vec::new(),
            connection: None,
            mid: None,
            direction: None,
            ice_ufrag: None,
            ice_pwd: None,
            ice_options: None,
            fingerprint: None,
            setup: None,
            rtcp_mux: false,
            rtcp_rsize: false,
            rtpmaps: Vec::new(),
            fmtps: Vec::new(),
            rtcp_fbs: Vec::new(),
            extmaps: Vec::new(),
            ssrcs: Vec::new(),
            ssrc_groups: Vec::new(),
            candidates: Vec::new(),
            end_of_candidates: false,
        }
    }

    /// Effective direction; sendrecv when the offer does not say
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction.unwrap_or(Direction::SendRecv)
    }

    pub fn rtpmap(&self, payload_type: u8) -> Option<&RtpMap> {
        self.rtpmaps.iter().find(|r| r.payload_type == payload_type)
    }

    pub fn fmtp(&self, payload_type: u8) -> Option<&Fmtp> {
        self.fmtps.iter().find(|f| f.payload_type == payload_type)
    }

    pub fn rtcp_fbs_for(&self, payload_type: u8) -> impl Iterator<Item = &RtcpFb> {
        self.rtcp_fbs.iter().filter(move |fb| fb.applies_to(payload_type))
    }

    fn parse_m_line(value: &str) -> Result<Self, SdpError> {
        let parts: Vec<&str> = value.split_whitespace().collect();
        if parts.len() < 3 {
            return Err(SdpError::InvalidMedia(value.to_string()));
        }
        let port = parts[1]
            .split('/')
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| SdpError::InvalidMedia(value.to_string()))?;

        let mut media = Self::new(parts[0], port, parts[2]);
        media.formats = parts[3..].iter().map(|s| (*s).to_string()).collect();
        Ok(media)
    }

    fn apply_attribute(&mut self, name: &str, value: Option<&str>) -> Result<(), SdpError> {
        if let Some(direction) = Direction::from_attribute(name) {
            self.direction = Some(direction);
            return Ok(());
        }

        match (name, value) {
            ("mid", Some(v)) => self.mid = Some(v.to_string()),
            ("ice-ufrag", Some(v)) => self.ice_ufrag = Some(v.to_string()),
            ("ice-pwd", Some(v)) => self.ice_pwd = Some(v.to_string()),
            ("ice-options", Some(v)) => self.ice_options = Some(v.to_string()),
            ("fingerprint", Some(v)) => self.fingerprint = Some(parse_fingerprint(v)?),
            ("setup", Some(v)) => self.setup = Some(v.to_string()),
            ("rtcp-mux", _) => self.rtcp_mux = true,
            ("rtcp-rsize", _) => self.rtcp_rsize = true,
            ("end-of-candidates", _) => self.end_of_candidates = true,
            ("rtpmap", Some(v)) => self.rtpmaps.push(parse_rtpmap(v)?),
            ("fmtp", Some(v)) => {
                let (pt, config) = v.split_once(' ').unwrap_or((v, ""));
                self.fmtps.push(Fmtp {
                    payload_type: pt.parse().map_err(|_| invalid_attribute(name, v))?,
                    config: config.trim().to_string(),
                });
            }
            ("rtcp-fb", Some(v)) => self.rtcp_fbs.push(parse_rtcp_fb(v)?),
            ("extmap", Some(v)) => self.extmaps.push(parse_extmap(v)?),
            ("ssrc", Some(v)) => self.ssrcs.push(parse_ssrc(v)?),
            ("ssrc-group", Some(v)) => {
                let mut parts = v.split_whitespace();
                let semantics = parts.next().ok_or_else(|| invalid_attribute(name, v))?;
                let ssrcs = parts
                    .map(str::parse)
                    .collect::<Result<Vec<u32>, _>>()
                    .map_err(|_| invalid_attribute(name, v))?;
                self.ssrc_groups.push(SsrcGroup {
                    semantics: semantics.to_string(),
                    ssrcs,
                });
            }
            // unusual candidates (mDNS, ipv6 zones) are not ours to validate
            ("candidate", Some(v)) => {
                if let Ok(candidate) = v.parse() {
                    self.candidates.push(candidate);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn parse_fingerprint(value: &str) -> Result<Fingerprint, SdpError> {
    let (algorithm, hash) = value
        .split_once(' ')
        .ok_or_else(|| invalid_attribute("fingerprint", value))?;
    Ok(Fingerprint {
        algorithm: algorithm.to_string(),
        hash: hash.trim().to_string(),
    })
}

fn parse_rtpmap(value: &str) -> Result<RtpMap, SdpError> {
    let err = || invalid_attribute("rtpmap", value);
    let (pt, encoding) = value.split_once(' ').ok_or_else(err)?;
    let mut parts = encoding.trim().split('/');
    let name = parts.next().filter(|n| !n.is_empty()).ok_or_else(err)?;
    let clock_rate = parts.next().and_then(|r| r.parse().ok()).ok_or_else(err)?;
    let channels = parts.next().map(str::parse).transpose().map_err(|_| err())?;

    Ok(RtpMap {
        payload_type: pt.parse().map_err(|_| err())?,
        encoding: name.to_string(),
        clock_rate,
        channels,
    })
}

fn parse_rtcp_fb(value: &str) -> Result<RtcpFb, SdpError> {
    let err = || invalid_attribute("rtcp-fb", value);
    let mut parts = value.split_whitespace();
    let payload_type = match parts.next().ok_or_else(err)? {
        "*" => None,
        pt => Some(pt.parse().map_err(|_| err())?),
    };
    let feedback_type = parts.next().ok_or_else(err)?.to_string();
    let parameter = parts.collect::<Vec<_>>().join(" ");

    Ok(RtcpFb {
        payload_type,
        feedback_type,
        parameter,
    })
}

fn parse_extmap(value: &str) -> Result<ExtMap, SdpError> {
    let err = || invalid_attribute("extmap", value);
    let mut parts = value.split_whitespace();
    let id_part = parts.next().ok_or_else(err)?;
    let uri = parts.next().ok_or_else(err)?.to_string();
    let (id, direction) = match id_part.split_once('/') {
        Some((id, direction)) => (id, Some(direction.to_string())),
        None => (id_part, None),
    };

    Ok(ExtMap {
        id: id.parse().map_err(|_| err())?,
        direction,
        uri,
    })
}

fn parse_ssrc(value: &str) -> Result<SsrcAttribute, SdpError> {
    let err = || invalid_attribute("ssrc", value);
    let (ssrc, rest) = value.split_once(' ').unwrap_or((value, ""));
    let (attribute, attr_value) = match rest.split_once(':') {
        Some((a, v)) => (a, Some(v.to_string())),
        None => (rest, None),
    };

    Ok(SsrcAttribute {
        ssrc: ssrc.parse().map_err(|_| err())?,
        attribute: attribute.trim().to_string(),
        value: attr_value,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionDescription {
    pub origin: Origin,
    pub session_name: String,
    pub connection: Option<String>,
    pub ice_lite: bool,
    pub ice_ufrag: Option<String>,
    pub ice_pwd: Option<String>,
    pub ice_options: Option<String>,
    pub fingerprint: Option<Fingerprint>,
    pub setup: Option<String>,
    pub groups: Vec<Group>,
    pub media: Vec<MediaDescription>,
}

impl SessionDescription {
    pub fn parse(sdp: &str) -> Result<Self, SdpError> {
        let mut lines = sdp
            .lines()
            .map(|l| l.trim_end_matches('\r'))
            .enumerate()
            .filter(|(_, l)| !l.trim().is_empty());

        match lines.next() {
            None => return Err(SdpError::Empty),
            Some((_, "v=0")) => {}
            Some(_) => return Err(SdpError::MissingVersion),
        }

        let mut session = Self::default();
        for (index, line) in lines {
            let invalid = || SdpError::InvalidLine {
                line: index + 1,
                content: line.to_string(),
            };
            let (kind, value) = line.split_once('=').ok_or_else(invalid)?;
            if kind.len() != 1 {
                return Err(invalid());
            }

            match kind {
                "o" => session.origin = parse_origin(value).ok_or_else(invalid)?,
                "s" => session.session_name = value.to_string(),
                "c" => {
                    let address = value.rsplit(' ').next().map(str::to_string);
                    match session.media.last_mut() {
                        Some(media) => media.connection = address,
                        None => session.connection = address,
                    }
                }
                "m" => session.media.push(MediaDescription::parse_m_line(value)?),
                "a" => {
                    let (name, attr) = match value.split_once(':') {
                        Some((n, v)) => (n, Some(v)),
                        None => (value, None),
                    };
                    match session.media.last_mut() {
                        Some(media) => media.apply_attribute(name, attr)?,
                        None => session.apply_attribute(name, attr)?,
                    }
                }
                _ => {}
            }
        }

        Ok(session)
    }

    fn apply_attribute(&mut self, name: &str, value: Option<&str>) -> Result<(), SdpError> {
        match (name, value) {
            ("ice-lite", _) => self.ice_lite = true,
            ("ice-ufrag", Some(v)) => self.ice_ufrag = Some(v.to_string()),
            ("ice-pwd", Some(v)) => self.ice_pwd = Some(v.to_string()),
            ("ice-options", Some(v)) => self.ice_options = Some(v.to_string()),
            ("fingerprint", Some(v)) => self.fingerprint = Some(parse_fingerprint(v)?),
            ("setup", Some(v)) => self.setup = Some(v.to_string()),
            ("group", Some(v)) => {
                let mut parts = v.split_whitespace();
                if let Some(semantics) = parts.next() {
                    self.groups.push(Group {
                        semantics: semantics.to_string(),
                        mids: parts.map(str::to_string).collect(),
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// ICE ufrag at session level, else from the first media section
    pub fn ice_ufrag(&self) -> Option<&str> {
        self.ice_ufrag
            .as_deref()
            .or_else(|| self.media.first().and_then(|m| m.ice_ufrag.as_deref()))
    }

    /// ICE password at session level, else from the first media section
    pub fn ice_pwd(&self) -> Option<&str> {
        self.ice_pwd
            .as_deref()
            .or_else(|| self.media.first().and_then(|m| m.ice_pwd.as_deref()))
    }

    /// DTLS fingerprint at session level, else from the first media section
    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        self.fingerprint
            .as_ref()
            .or_else(|| self.media.first().and_then(|m| m.fingerprint.as_ref()))
    }

    pub fn bundle_group(&self) -> Option<&Group> {
        self.groups.iter().find(|g| g.semantics == "BUNDLE")
    }
}

fn parse_origin(value: &str) -> Option<Origin> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    if parts.len() != 6 {
        return None;
    }
    Some(Origin {
        username: parts[0].to_string(),
        session_id: parts[1].to_string(),
        session_version: parts[2].to_string(),
        address: parts[5].to_string(),
    })
}

fn write_line(out: &mut String, line: fmt::Arguments<'_>) {
    let _ = out.write_fmt(line);
    out.push_str("\r\n");
}

impl MediaDescription {
    fn write_to(&self, out: &mut String) {
        let mut m_line = format!("m={} {} {}", self.media, self.port, self.protocol);
        for format in &self.formats {
            m_line.push(' ');
            m_line.push_str(format);
        }
        write_line(out, format_args!("{m_line}"));

        if let Some(connection) = &self.connection {
            write_line(out, format_args!("c=IN IP4 {connection}"));
        }
        if let Some(ufrag) = &self.ice_ufrag {
            write_line(out, format_args!("a=ice-ufrag:{ufrag}"));
        }
        if let Some(pwd) = &self.ice_pwd {
            write_line(out, format_args!("a=ice-pwd:{pwd}"));
        }
        if let Some(options) = &self.ice_options {
            write_line(out, format_args!("a=ice-options:{options}"));
        }
        if let Some(fp) = &self.fingerprint {
            write_line(out, format_args!("a=fingerprint:{} {}", fp.algorithm, fp.hash));
        }
        if let Some(setup) = &self.setup {
            write_line(out, format_args!("a=setup:{setup}"));
        }
        if let Some(mid) = &self.mid {
            write_line(out, format_args!("a=mid:{mid}"));
        }
        for ext in &self.extmaps {
            match &ext.direction {
                Some(direction) => {
                    write_line(out, format_args!("a=extmap:{}/{direction} {}", ext.id, ext.uri));
                }
                None => write_line(out, format_args!("a=extmap:{} {}", ext.id, ext.uri)),
            }
        }
        if let Some(direction) = &self.direction {
            write_line(out, format_args!("a={}", direction.as_str()));
        }
        if self.rtcp_mux {
            write_line(out, format_args!("a=rtcp-mux"));
        }
        if self.rtcp_rsize {
            write_line(out, format_args!("a=rtcp-rsize"));
        }
        for rtpmap in &self.rtpmaps {
            match rtpmap.channels {
                Some(channels) => write_line(
                    out,
                    format_args!(
                        "a=rtpmap:{} {}/{}/{channels}",
                        rtpmap.payload_type, rtpmap.encoding, rtpmap.clock_rate
                    ),
                ),
                None => write_line(
                    out,
                    format_args!(
                        "a=rtpmap:{} {}/{}",
                        rtpmap.payload_type, rtpmap.encoding, rtpmap.clock_rate
                    ),
                ),
            }
        }
        for fb in &self.rtcp_fbs {
            let pt = fb.payload_type.map_or_else(|| "*".to_string(), |pt| pt.to_string());
            if fb.parameter.is_empty() {
                write_line(out, format_args!("a=rtcp-fb:{pt} {}", fb.feedback_type));
            } else {
                write_line(
                    out,
                    format_args!("a=rtcp-fb:{pt} {} {}", fb.feedback_type, fb.parameter),
                );
            }
        }
        for fmtp in &self.fmtps {
            write_line(out, format_args!("a=fmtp:{} {}", fmtp.payload_type, fmtp.config));
        }
        for group in &self.ssrc_groups {
            let ssrcs: Vec<String> = group.ssrcs.iter().map(u32::to_string).collect();
            write_line(
                out,
                format_args!("a=ssrc-group:{} {}", group.semantics, ssrcs.join(" ")),
            );
        }
        for ssrc in &self.ssrcs {
            match &ssrc.value {
                Some(value) => write_line(
                    out,
                    format_args!("a=ssrc:{} {}:{value}", ssrc.ssrc, ssrc.attribute),
                ),
                None => write_line(out, format_args!("a=ssrc:{} {}", ssrc.ssrc, ssrc.attribute)),
            }
        }
        for candidate in &self.candidates {
            write_line(out, format_args!("a=candidate:{candidate}"));
        }
        if self.end_of_candidates {
            write_line(out, format_args!("a=end-of-candidates"));
        }
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        write_line(&mut out, format_args!("v=0"));
        write_line(
            &mut out,
            format_args!(
                "o={} {} {} IN IP4 {}",
                self.origin.username,
                self.origin.session_id,
                self.origin.session_version,
                self.origin.address
            ),
        );
        let name = if self.session_name.is_empty() {
            "-"
        } else {
            self.session_name.as_str()
        };
        write_line(&mut out, format_args!("s={name}"));
        if let Some(connection) = &self.connection {
            write_line(&mut out, format_args!("c=IN IP4 {connection}"));
        }
        write_line(&mut out, format_args!("t=0 0"));
        if self.ice_lite {
            write_line(&mut out, format_args!("a=ice-lite"));
        }
        for group in &self.groups {
            write_line(
                &mut out,
                format_args!("a=group:{} {}", group.semantics, group.mids.join(" ")),
            );
        }
        if let Some(ufrag) = &self.ice_ufrag {
            write_line(&mut out, format_args!("a=ice-ufrag:{ufrag}"));
        }
        if let Some(pwd) = &self.ice_pwd {
            write_line(&mut out, format_args!("a=ice-pwd:{pwd}"));
        }
        if let Some(fp) = &self.fingerprint {
            write_line(&mut out, format_args!("a=fingerprint:{} {}", fp.algorithm, fp.hash));
        }
        if let Some(setup) = &self.setup {
            write_line(&mut out, format_args!("a=setup:{setup}"));
        }
        for media in &self.media {
            media.write_to(&mut out);
        }
        f.write_str(&out)
    }
}
