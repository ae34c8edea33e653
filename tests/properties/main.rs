mod ordering_tests;
