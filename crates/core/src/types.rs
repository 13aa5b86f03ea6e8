//! 공통 도메인 타입 -- 단계, 심각도, 헤더 이름 규칙
//!
//! 심각도, 평가 단계(phase), 헤더 이름 규칙처럼
//! 엔진과 파이프라인이 함께 사용하는 작은 값 타입을 정의합니다.

use std::fmt;

use serde::{Deserialize, Serialize};

/// 심각도
///
/// 탐지 결과(Finding)의 심각도를 나타냅니다.
/// `Ord` 구현으로 심각도 비교가 가능합니다 (`Info < Low < Medium < High < Critical`).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Severity {
    /// 정보성 이벤트
    #[default]
    Info,
    /// 낮은 심각도 (SecLang NOTICE)
    Low,
    /// 중간 심각도 (SecLang WARNING)
    Medium,
    /// 높은 심각도 (SecLang ERROR)
    High,
    /// 치명적 (SecLang CRITICAL 이상)
    Critical,
}

impl Severity {
    /// 문자열에서 심각도를 파싱합니다.
    ///
    /// 대소문자를 구분하지 않습니다.
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "info" | "informational" => Some(Self::Info),
            "low" => Some(Self::Low),
            "medium" | "med" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" | "crit" => Some(Self::Critical),
            _ => None,
        }
    }

    /// SecLang `severity` 액션 값을 해석합니다.
    ///
    /// 숫자(0-7)와 이름(`CRITICAL`, `WARNING` 등)을 모두 허용합니다.
    pub fn from_seclang(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "0" | "EMERGENCY" | "1" | "ALERT" | "2" | "CRITICAL" => Some(Self::Critical),
            "3" | "ERROR" => Some(Self::High),
            "4" | "WARNING" => Some(Self::Medium),
            "5" | "NOTICE" => Some(Self::Low),
            "6" | "INFO" | "7" | "DEBUG" => Some(Self::Info),
            _ => None,
        }
    }

    /// CRS 이상 점수(anomaly score) 기여도
    ///
    /// CRS 기본값: critical 5, error 4, warning 3, notice 2.
    pub fn anomaly_score(self) -> u32 {
        match self {
            Self::Critical => 5,
            Self::High => 4,
            Self::Medium => 3,
            Self::Low => 2,
            Self::Info => 0,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "Info"),
            Self::Low => write!(f, "Low"),
            Self::Medium => write!(f, "Medium"),
            Self::High => write!(f, "High"),
            Self::Critical => write!(f, "Critical"),
        }
    }
}

/// 트랜잭션 평가 단계
///
/// 엔진은 한 트랜잭션의 단계를 반드시 아래 순서대로 평가합니다.
/// `RequestHeaders → RequestBody → ResponseHeaders → ResponseBody`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// 요청 헤더 (SecLang phase 1)
    RequestHeaders,
    /// 요청 본문 (SecLang phase 2)
    RequestBody,
    /// 응답 헤더 (SecLang phase 3)
    ResponseHeaders,
    /// 응답 본문 (SecLang phase 4)
    ResponseBody,
}

impl Phase {
    /// 평가 순서대로 나열한 전체 단계
    pub const ALL: [Phase; 4] = [
        Phase::RequestHeaders,
        Phase::RequestBody,
        Phase::ResponseHeaders,
        Phase::ResponseBody,
    ];

    /// SecLang phase 번호 (1-4)
    pub fn number(self) -> u8 {
        match self {
            Self::RequestHeaders => 1,
            Self::RequestBody => 2,
            Self::ResponseHeaders => 3,
            Self::ResponseBody => 4,
        }
    }

    /// SecLang phase 번호에서 단계를 얻습니다. 5(logging)는 평가 단계가 아닙니다.
    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(Self::RequestHeaders),
            2 => Some(Self::RequestBody),
            3 => Some(Self::ResponseHeaders),
            4 => Some(Self::ResponseBody),
            _ => None,
        }
    }

    /// 다음 단계. 마지막 단계면 `None`.
    pub fn next(self) -> Option<Self> {
        Self::from_number(self.number() + 1)
    }

    /// 본문 단계 여부
    pub fn is_body(self) -> bool {
        matches!(self, Self::RequestBody | Self::ResponseBody)
    }

    /// 사람이 읽을 수 있는 이름 (`request-body` 등)
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequestHeaders => "request-headers",
            Self::RequestBody => "request-body",
            Self::ResponseHeaders => "response-headers",
            Self::ResponseBody => "response-body",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 엔진이 기대하는 헤더 이름 규칙
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderCase {
    /// 소문자로 변환 (내장 SecLang 엔진)
    #[default]
    Lower,
    /// 캡처된 그대로 유지
    Preserve,
}

impl HeaderCase {
    /// 헤더 이름에 규칙을 적용합니다.
    pub fn apply(self, name: &str) -> String {
        match self {
            Self::Lower => name.to_ascii_lowercase(),
            Self::Preserve => name.to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering() {
        assert!(Severity::Info < Severity::Low);
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn severity_default_is_info() {
        assert_eq!(Severity::default(), Severity::Info);
    }

    #[test]
    fn severity_from_str_loose() {
        assert_eq!(Severity::from_str_loose("info"), Some(Severity::Info));
        assert_eq!(
            Severity::from_str_loose("CRITICAL"),
            Some(Severity::Critical)
        );
        assert_eq!(Severity::from_str_loose("Med"), Some(Severity::Medium));
        assert_eq!(Severity::from_str_loose("unknown"), None);
    }

    #[test]
    fn severity_from_seclang_names_and_numbers() {
        assert_eq!(Severity::from_seclang("CRITICAL"), Some(Severity::Critical));
        assert_eq!(Severity::from_seclang("2"), Some(Severity::Critical));
        assert_eq!(Severity::from_seclang("error"), Some(Severity::High));
        assert_eq!(Severity::from_seclang("WARNING"), Some(Severity::Medium));
        assert_eq!(Severity::from_seclang("5"), Some(Severity::Low));
        assert_eq!(Severity::from_seclang("DEBUG"), Some(Severity::Info));
        assert_eq!(Severity::from_seclang("loud"), None);
    }

    #[test]
    fn severity_anomaly_scores_follow_crs_defaults() {
        assert_eq!(Severity::Critical.anomaly_score(), 5);
        assert_eq!(Severity::High.anomaly_score(), 4);
        assert_eq!(Severity::Medium.anomaly_score(), 3);
        assert_eq!(Severity::Low.anomaly_score(), 2);
        assert_eq!(Severity::Info.anomaly_score(), 0);
    }

    #[test]
    fn phase_order_is_request_then_response() {
        let numbers: Vec<u8> = Phase::ALL.iter().map(|p| p.number()).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
        assert!(Phase::RequestHeaders < Phase::ResponseBody);
        assert_eq!(Phase::RequestBody.next(), Some(Phase::ResponseHeaders));
        assert_eq!(Phase::ResponseBody.next(), None);
    }

    #[test]
    fn phase_from_number_rejects_logging_phase() {
        assert_eq!(Phase::from_number(2), Some(Phase::RequestBody));
        assert_eq!(Phase::from_number(5), None);
        assert_eq!(Phase::from_number(0), None);
    }

    #[test]
    fn phase_display_and_serde_use_kebab_case() {
        assert_eq!(Phase::RequestBody.to_string(), "request-body");
        let json = serde_json::to_string(&Phase::ResponseHeaders).unwrap();
        assert_eq!(json, "\"response-headers\"");
    }

    #[test]
    fn header_case_apply() {
        assert_eq!(HeaderCase::Lower.apply("X-Forwarded-For"), "x-forwarded-for");
        assert_eq!(HeaderCase::Preserve.apply("X-Forwarded-For"), "X-Forwarded-For");
    }
}
