//! 라우터 진단 카운터 필터
//!
//! 32비트 필터 워드 레이아웃:
//! ```text
//! bit 0..4   패킷 종류
//! bit 4..8   비상 라우팅 상태
//! bit 8      비상 라우팅 모드 (1 = 나가는 패킷 기준)
//! bit 10..12 기본 라우팅 여부
//! bit 12..14 페이로드 유무
//! bit 14..16 출발지
//! bit 16..25 목적지
//! bit 30     카운터 이벤트 인터럽트
//! ```
//! 필드가 비어 있으면 그 필드의 모든 값과 일치한다.

use bitflags::bitflags;

const PACKET_TYPE_OFFSET: u32 = 0;
const EMERGENCY_ROUTE_OFFSET: u32 = 4;
const EMERGENCY_ROUTE_MODE_OFFSET: u32 = 8;
const DEFAULT_ROUTE_OFFSET: u32 = 10;
const PAYLOAD_OFFSET: u32 = 12;
const SOURCE_OFFSET: u32 = 14;
const DESTINATION_OFFSET: u32 = 16;
const ENABLE_INTERRUPT_OFFSET: u32 = 30;

bitflags! {
    /// 패킷 종류
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PacketTypes: u32 {
        const MULTICAST = 1 << 0;
        const POINT_TO_POINT = 1 << 1;
        const NEAREST_NEIGHBOUR = 1 << 2;
        const FIXED_ROUTE = 1 << 3;
    }
}

bitflags! {
    /// 비상 라우팅 상태
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EmergencyRoutingStatuses: u32 {
        const NORMAL = 1 << 0;
        const FIRST_STAGE_COMBINED = 1 << 1;
        const FIRST_STAGE = 1 << 2;
        const SECOND_STAGE = 1 << 3;
    }
}

bitflags! {
    /// 기본 라우팅 여부
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DefaultRoutingStatuses: u32 {
        const DEFAULT_ROUTED = 1 << 0;
        const NON_DEFAULT_ROUTED = 1 << 1;
    }
}

bitflags! {
    /// 페이로드 유무
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PayloadStatuses: u32 {
        const WITH_PAYLOAD = 1 << 0;
        const WITHOUT_PAYLOAD = 1 << 1;
    }
}

bitflags! {
    /// 출발지
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Sources: u32 {
        const LOCAL = 1 << 0;
        const NON_LOCAL = 1 << 1;
    }
}

bitflags! {
    /// 목적지
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Destinations: u32 {
        const DUMP = 1 << 0;
        const LOCAL = 1 << 1;
        const LOCAL_MONITOR = 1 << 2;
        const LINK_0 = 1 << 3;
        const LINK_1 = 1 << 4;
        const LINK_2 = 1 << 5;
        const LINK_3 = 1 << 6;
        const LINK_4 = 1 << 7;
        const LINK_5 = 1 << 8;
    }
}

/// 진단 카운터 필터
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticFilter {
    pub enable_interrupt_on_counter_event: bool,
    /// true 면 들어오는 패킷의 비상 라우팅 상태로 비교
    pub match_emergency_routing_status_to_incoming_packet: bool,
    pub destinations: Destinations,
    pub sources: Sources,
    pub payload_statuses: PayloadStatuses,
    pub default_routing_statuses: DefaultRoutingStatuses,
    pub emergency_routing_statuses: EmergencyRoutingStatuses,
    pub packet_types: PacketTypes,
}

/// 비어 있으면 전체로 바꾼다
macro_rules! all_if_empty {
    ($value:expr, $ty:ty) => {
        if $value.is_empty() {
            <$ty>::all()
        } else {
            $value
        }
    };
}

impl DiagnosticFilter {
    /// 새 필터 생성; 빈 필드는 "모두 일치" 로 정규화
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        enable_interrupt_on_counter_event: bool,
        match_emergency_routing_status_to_incoming_packet: bool,
        destinations: Destinations,
        sources: Sources,
        payload_statuses: PayloadStatuses,
        default_routing_statuses: DefaultRoutingStatuses,
        emergency_routing_statuses: EmergencyRoutingStatuses,
        packet_types: PacketTypes,
    ) -> Self {
        Self {
            enable_interrupt_on_counter_event,
            match_emergency_routing_status_to_incoming_packet,
            destinations: all_if_empty!(destinations, Destinations),
            sources: all_if_empty!(sources, Sources),
            payload_statuses: all_if_empty!(payload_statuses, PayloadStatuses),
            default_routing_statuses: all_if_empty!(
                default_routing_statuses,
                DefaultRoutingStatuses
            ),
            emergency_routing_statuses: all_if_empty!(
                emergency_routing_statuses,
                EmergencyRoutingStatuses
            ),
            packet_types: all_if_empty!(packet_types, PacketTypes),
        }
    }

    /// 모든 패킷과 일치하는 필터
    pub fn match_all() -> Self {
        Self::new(
            false,
            true,
            Destinations::empty(),
            Sources::empty(),
            PayloadStatuses::empty(),
            DefaultRoutingStatuses::empty(),
            EmergencyRoutingStatuses::empty(),
            PacketTypes::empty(),
        )
    }

    /// 라우터에 기록할 필터 워드
    pub fn filter_word(&self) -> u32 {
        let mut word = 0;
        if self.enable_interrupt_on_counter_event {
            word |= 1 << ENABLE_INTERRUPT_OFFSET;
        }
        if !self.match_emergency_routing_status_to_incoming_packet {
            word |= 1 << EMERGENCY_ROUTE_MODE_OFFSET;
        }
        word |= all_if_empty!(self.destinations, Destinations).bits() << DESTINATION_OFFSET;
        word |= all_if_empty!(self.sources, Sources).bits() << SOURCE_OFFSET;
        word |= all_if_empty!(self.payload_statuses, PayloadStatuses).bits() << PAYLOAD_OFFSET;
        word |= all_if_empty!(self.default_routing_statuses, DefaultRoutingStatuses).bits()
            << DEFAULT_ROUTE_OFFSET;
        word |= all_if_empty!(self.emergency_routing_statuses, EmergencyRoutingStatuses).bits()
            << EMERGENCY_ROUTE_OFFSET;
        word |= all_if_empty!(self.packet_types, PacketTypes).bits() << PACKET_TYPE_OFFSET;
        word
    }

    /// 필터 워드에서 복원
    pub fn read_from_int(word: u32) -> Self {
        Self::new(
            (word >> ENABLE_INTERRUPT_OFFSET) & 1 == 1,
            (word >> EMERGENCY_ROUTE_MODE_OFFSET) & 1 == 0,
            Destinations::from_bits_truncate(word >> DESTINATION_OFFSET),
            Sources::from_bits_truncate(word >> SOURCE_OFFSET),
            PayloadStatuses::from_bits_truncate(word >> PAYLOAD_OFFSET),
            DefaultRoutingStatuses::from_bits_truncate(word >> DEFAULT_ROUTE_OFFSET),
            EmergencyRoutingStatuses::from_bits_truncate(word >> EMERGENCY_ROUTE_OFFSET),
            PacketTypes::from_bits_truncate(word >> PACKET_TYPE_OFFSET),
        )
    }
}

impl Default for DiagnosticFilter {
    fn default() -> Self {
        Self::match_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_all_word() {
        let filter = DiagnosticFilter::match_all();
        let word = filter.filter_word();
        assert_eq!(word & 0xF, 0xF);
        assert_eq!((word >> 16) & 0x1FF, 0x1FF);
        assert_eq!((word >> 8) & 1, 0);
        assert_eq!((word >> 30) & 1, 0);
        assert_eq!(DiagnosticFilter::read_from_int(word), filter);
    }

    #[test]
    fn test_round_trip_mixed_fields() {
        let filters = [
            DiagnosticFilter::new(
                true,
                false,
                Destinations::LINK_0 | Destinations::LINK_5,
                Sources::NON_LOCAL,
                PayloadStatuses::empty(),
                DefaultRoutingStatuses::DEFAULT_ROUTED,
                EmergencyRoutingStatuses::FIRST_STAGE | EmergencyRoutingStatuses::SECOND_STAGE,
                PacketTypes::MULTICAST,
            ),
            DiagnosticFilter::new(
                false,
                true,
                Destinations::empty(),
                Sources::LOCAL,
                PayloadStatuses::WITHOUT_PAYLOAD,
                DefaultRoutingStatuses::empty(),
                EmergencyRoutingStatuses::NORMAL,
                PacketTypes::POINT_TO_POINT | PacketTypes::FIXED_ROUTE,
            ),
        ];
        for filter in filters {
            assert_eq!(DiagnosticFilter::read_from_int(filter.filter_word()), filter);
        }
    }

    #[test]
    fn test_field_positions() {
        let filter = DiagnosticFilter::new(
            true,
            false,
            Destinations::LOCAL_MONITOR,
            Sources::LOCAL,
            PayloadStatuses::WITH_PAYLOAD,
            DefaultRoutingStatuses::NON_DEFAULT_ROUTED,
            EmergencyRoutingStatuses::NORMAL,
            PacketTypes::NEAREST_NEIGHBOUR,
        );
        let expected = (1 << 30) | (1 << 8) | (1 << 18) | (1 << 14) | (1 << 12) | (1 << 11)
            | (1 << 4)
            | (1 << 2);
        assert_eq!(filter.filter_word(), expected);
    }
}
